use chrono::{DateTime, Utc};
use piecemeal_core::{ChannelId, PieceId};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageHandle {
    pub channel_id: ChannelId,
    pub message_id: String,
}

/// Public offer of one piece, as handed to the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropAnnouncement {
    pub channel_id: ChannelId,
    pub session_id: Uuid,
    pub slug: String,
    pub puzzle_name: String,
    pub piece_id: PieceId,
    pub claim_limit: u32,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl DropAnnouncement {
    pub fn content(&self) -> String {
        let seats = if self.claim_limit == 1 {
            "the first collector".to_string()
        } else {
            format!("the first {} collectors", self.claim_limit)
        };
        format!(
            "A piece of {} appeared! Piece #{} goes to {}.",
            self.puzzle_name, self.piece_id, seats
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("channel {channel_id}: {message}")]
pub struct ChannelError {
    pub channel_id: ChannelId,
    pub message: String,
}

impl ChannelError {
    pub fn new(channel_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message: message.into(),
        }
    }
}

pub trait DropChannel: Send + Sync {
    fn announce(&self, announcement: &DropAnnouncement) -> Result<MessageHandle, ChannelError>;

    fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("reward {reward_ref} not granted: {reason}")]
pub struct RewardError {
    pub reward_ref: String,
    pub reason: String,
}

impl RewardError {
    pub fn new(reward_ref: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reward_ref: reward_ref.into(),
            reason: reason.into(),
        }
    }
}

pub trait RewardGranter: Send + Sync {
    fn grant(&self, user_id: &str, slug: &str, reward_ref: &str) -> Result<(), RewardError>;
}

/// Granter for deployments without external rewards; every grant succeeds.
pub struct NoRewards;

impl RewardGranter for NoRewards {
    fn grant(&self, _user_id: &str, _slug: &str, _reward_ref: &str) -> Result<(), RewardError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingChannel {
        pub announcements: Mutex<Vec<DropAnnouncement>>,
        pub edits: Mutex<Vec<(MessageHandle, String)>>,
        pub fail_announce: AtomicBool,
        next_id: AtomicUsize,
    }

    impl DropChannel for RecordingChannel {
        fn announce(&self, announcement: &DropAnnouncement) -> Result<MessageHandle, ChannelError> {
            if self.fail_announce.load(Ordering::SeqCst) {
                return Err(ChannelError::new(&announcement.channel_id, "send failed"));
            }
            self.announcements
                .lock()
                .expect("announcements lock")
                .push(announcement.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MessageHandle {
                channel_id: announcement.channel_id.clone(),
                message_id: format!("msg-{id}"),
            })
        }

        fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), ChannelError> {
            self.edits
                .lock()
                .expect("edits lock")
                .push((handle.clone(), content.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingRewards {
        pub grants: Mutex<Vec<(String, String, String)>>,
        pub fail: AtomicBool,
    }

    impl RewardGranter for RecordingRewards {
        fn grant(&self, user_id: &str, slug: &str, reward_ref: &str) -> Result<(), RewardError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RewardError::new(reward_ref, "member missing"));
            }
            self.grants.lock().expect("grants lock").push((
                user_id.to_string(),
                slug.to_string(),
                reward_ref.to_string(),
            ));
            Ok(())
        }
    }

    #[test]
    fn announcement_content_mentions_seats() {
        let announcement = DropAnnouncement {
            channel_id: "general".to_string(),
            session_id: Uuid::nil(),
            slug: "demo".to_string(),
            puzzle_name: "Demo".to_string(),
            piece_id: 2,
            claim_limit: 3,
            expires_at: Utc::now(),
            image_ref: None,
        };
        assert_eq!(
            announcement.content(),
            "A piece of Demo appeared! Piece #2 goes to the first 3 collectors."
        );
    }
}
