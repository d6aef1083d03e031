use serde::{Deserialize, Serialize};
use std::fmt;

/// Job instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, no chunk dispatched yet
    #[default]
    Queued,
    /// At least one chunk has been dispatched
    InProgress,
    /// Every chunk of every step succeeded
    Completed,
    /// All work attempted, some chunks failed recoverably; needs operator attention
    Errored,
    /// An unrecoverable error aborted the instance
    Failed,
    /// Cancellation requested and all in-flight chunks drained
    Cancelled,
}

impl JobStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if chunks of an instance in this state may still be dispatched
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress | Self::Errored)
    }

    /// Whether a transition into this state stamps the instance end time
    pub fn sets_end_time(&self) -> bool {
        self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "ERRORED" => Ok(Self::Errored),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Work chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
}

impl ChunkStatus {
    /// Chunk has been executed to an outcome
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Chunk still counts against step completion
    pub fn is_open(&self) -> bool {
        !self.is_finished()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal_check() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Errored.is_terminal());
    }

    #[test]
    fn test_errored_still_accepts_dispatch() {
        assert!(JobStatus::Errored.accepts_dispatch());
        assert!(!JobStatus::Failed.accepts_dispatch());
        assert!(!JobStatus::Errored.sets_end_time());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(JobStatus::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!("ERRORED".parse::<JobStatus>().unwrap(), JobStatus::Errored);
        assert!("complete".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let parsed: ChunkStatus = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(parsed, ChunkStatus::Success);
    }
}
