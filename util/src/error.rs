//! Error taxonomy of the parameter server.
//!
//! Functions return `anyhow::Result` and bail with `EmbeddingError` where the kind matters to
//! the caller. The grpc layer recovers the kind with `downcast_ref` and sends `reason()` in the
//! error info of the status, the client maps the reason back with `from_reason`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    /// Caller sent a vector with wrong length. Fatal to the call, not to the process.
    #[error("dimension mismatch: expected {expected}, actual {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Shard did not respond after all retries.
    #[error("shard {shard} unreachable after {attempts} attempts: {message}")]
    ShardUnreachable {
        shard: usize,
        attempts: u32,
        message: String,
    },

    /// Worker registered after the cluster is formed.
    #[error("late join of rank {rank}, cluster state: {state}")]
    LateJoin { rank: u32, state: String },

    /// Sequence token replay detected.
    #[error("duplicate push, worker: {worker}, seq_id: {seq_id}")]
    DuplicatePush { worker: u32, seq_id: u64 },

    /// Feature id is not in the vocabulary range.
    #[error("feature id {id} out of range, vocabulary_size: {vocabulary_size}")]
    OutOfRange { id: u64, vocabulary_size: u64 },

    /// Feature id does not belong to this shard.
    #[error("feature id {id} is routed to shard {expected}, not shard {actual}")]
    Misrouted {
        id: u64,
        expected: usize,
        actual: usize,
    },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown optimizer: {0}")]
    UnknownOptimizer(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Server is draining or closed.
    #[error("shutting down, state: {0}")]
    ShuttingDown(String),

    /// Checkpoint cannot be restored into current table.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),
}

impl EmbeddingError {
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Reason string sent in grpc error info.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::ShardUnreachable { .. } => "SHARD_UNREACHABLE",
            Self::LateJoin { .. } => "LATE_JOIN",
            Self::DuplicatePush { .. } => "DUPLICATE_PUSH",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::Misrouted { .. } => "MISROUTED",
            Self::UnknownTable(_) => "UNKNOWN_TABLE",
            Self::UnknownOptimizer(_) => "UNKNOWN_OPTIMIZER",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::ShuttingDown(_) => "SHUTTING_DOWN",
            Self::CheckpointMismatch(_) => "CHECKPOINT_MISMATCH",
        }
    }

    /// Rebuild error from reason and status message on client side.
    ///
    /// Details of the variant are lost except the message, the numbers of `DimensionMismatch` are
    /// parsed back from the message when possible.
    pub fn from_reason(reason: &str, message: &str) -> Option<Self> {
        let res = match reason {
            "DIMENSION_MISMATCH" => {
                let (expected, actual) = parse_expected_actual(message).unwrap_or((0, 0));
                Self::DimensionMismatch { expected, actual }
            }
            "LATE_JOIN" => Self::LateJoin {
                rank: 0,
                state: message.to_string(),
            },
            "OUT_OF_RANGE" => {
                let numbers = numbers_in(message);
                Self::OutOfRange {
                    id: numbers.first().copied().unwrap_or(0),
                    vocabulary_size: numbers.get(1).copied().unwrap_or(0),
                }
            }
            "MISROUTED" => {
                let numbers = numbers_in(message);
                Self::Misrouted {
                    id: numbers.first().copied().unwrap_or(0),
                    expected: numbers.get(1).copied().unwrap_or(0) as usize,
                    actual: numbers.get(2).copied().unwrap_or(0) as usize,
                }
            }
            "UNKNOWN_TABLE" => Self::UnknownTable(message.to_string()),
            "UNKNOWN_OPTIMIZER" => Self::UnknownOptimizer(message.to_string()),
            "INVALID_CONFIG" => Self::InvalidConfig(message.to_string()),
            "SHUTTING_DOWN" => Self::ShuttingDown(message.to_string()),
            "CHECKPOINT_MISMATCH" => Self::CheckpointMismatch(message.to_string()),
            _ => return None,
        };

        Some(res)
    }
}

/// All unsigned numbers in message, in order.
fn numbers_in(message: &str) -> Vec<u64> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|x| !x.is_empty())
        .filter_map(|x| x.parse().ok())
        .collect()
}

/// Parse `expected {a}, actual {b}` from message.
fn parse_expected_actual(message: &str) -> Option<(usize, usize)> {
    let number_after = |key: &str| -> Option<usize> {
        let start = message.find(key)? + key.len();
        let digits: String = message[start..]
            .chars()
            .skip_while(|c| c.is_whitespace())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    };

    Some((number_after("expected")?, number_after("actual")?))
}
