use proptest::prelude::*;

/// Outcome of one scripted chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkScript {
    Ok(u64),
    Recoverable,
    Unrecoverable,
}

impl ChunkScript {
    pub fn render(&self) -> String {
        match self {
            Self::Ok(records) => format!("ok:{records}"),
            Self::Recoverable => "recoverable:transient failure".to_string(),
            Self::Unrecoverable => "unrecoverable:fatal failure".to_string(),
        }
    }
}

/// Mostly successful chunks with the occasional failure
pub fn chunk_script_strategy() -> impl Strategy<Value = ChunkScript> {
    prop_oneof![
        8 => (0u64..50).prop_map(ChunkScript::Ok),
        2 => Just(ChunkScript::Recoverable),
        1 => Just(ChunkScript::Unrecoverable),
    ]
}

pub fn chunk_scripts_strategy() -> impl Strategy<Value = Vec<ChunkScript>> {
    prop::collection::vec(chunk_script_strategy(), 1..12)
}
