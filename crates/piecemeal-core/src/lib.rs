pub mod channel;
pub mod document;
pub mod error;
pub mod puzzle;
pub mod validate;

pub use channel::{ClaimRange, DropChannelConfig, PuzzleTarget, Trigger, TriggerMode, TriggerParams};
pub use document::{
    CompletionFlag, DropDocument, FinisherEntry, DOCUMENT_SCHEMA_VERSION,
};
pub use error::ConfigError;
pub use puzzle::{GridPosition, Puzzle};
pub use validate::validate_document;

pub type UserId = String;
pub type ChannelId = String;
pub type PieceId = u32;
