use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown puzzle: {0}")]
    UnknownPuzzle(String),
    #[error("puzzle {0} has no piece assets")]
    EmptyPieceMap(String),
    #[error("no enabled puzzles to drop")]
    NoEnabledPuzzles,
    #[error("invalid puzzle {slug}: {reason}")]
    InvalidPuzzle { slug: String, reason: String },
    #[error("unknown drop channel: {0}")]
    UnknownChannel(String),
    #[error("malformed drop channel {channel}: {reason}")]
    MalformedChannel { channel: String, reason: String },
    #[error("piece {piece_id} out of range for {slug} (1..={piece_count})")]
    PieceOutOfRange {
        slug: String,
        piece_id: u32,
        piece_count: u32,
    },
    #[error("user {user_id} owns piece {piece_id} outside the range of {slug}")]
    OwnedPieceOutOfRange {
        user_id: String,
        slug: String,
        piece_id: u32,
    },
}

impl ConfigError {
    pub fn malformed(channel: &str, reason: impl Into<String>) -> Self {
        Self::MalformedChannel {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_puzzle(slug: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPuzzle {
            slug: slug.to_string(),
            reason: reason.into(),
        }
    }
}
