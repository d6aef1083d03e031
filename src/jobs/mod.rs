//! Ready-made job definitions built on the engine.

pub mod bulk_import;
