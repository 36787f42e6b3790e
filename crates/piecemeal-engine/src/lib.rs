pub mod admin;
pub mod collaborators;
pub mod completion;
pub mod leaderboard;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use admin::{AdminError, DropAdmin, GrantOutcome, WipeTarget};
pub use collaborators::{
    ChannelError, DropAnnouncement, DropChannel, MessageHandle, NoRewards, RewardError,
    RewardGranter,
};
pub use completion::{CompletionDetector, CompletionError, CompletionOutcome, RewardStatus};
pub use leaderboard::{Leaderboard, LeaderboardEntry, OverallEntry};
pub use registry::ActiveDrops;
pub use scheduler::{DropScheduler, SchedulerConfig, SchedulerError, SpawnedDrop, TickReport};
pub use session::{
    ClaimError, ClaimReceipt, DropSession, SessionError, SessionStatus, SessionSummary,
};
