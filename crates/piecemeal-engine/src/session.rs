use crate::collaborators::{ChannelError, DropChannel, MessageHandle};
use crate::completion::{CompletionDetector, CompletionOutcome};
use chrono::{DateTime, Duration, Utc};
use piecemeal_core::{ChannelId, PieceId, UserId};
use piecemeal_storage::{PieceLedger, StorageError};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Open)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a claim is turned away. Shown to the claiming user only.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("this drop is {0}")]
    NotOpen(SessionStatus),
    #[error("this drop has expired")]
    Expired,
    #[error("you already claimed this drop")]
    AlreadyClaimed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] ClaimError),
    #[error("claim not saved: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub channel_id: ChannelId,
    pub slug: String,
    pub puzzle_name: String,
    pub piece_id: PieceId,
    pub claim_limit: u32,
    pub status: SessionStatus,
    pub claimants: Vec<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageHandle>,
}

impl SessionSummary {
    /// Text the drop announcement is edited to once the session ends.
    pub fn render_text(&self) -> String {
        let piece = format!("Piece #{} of {}", self.piece_id, self.puzzle_name);
        if self.claimants.is_empty() {
            return format!("{piece}: No collectors");
        }
        let verb = match self.status {
            SessionStatus::Completed => "collected by",
            _ => "closed. Collected by",
        };
        format!(
            "{piece} {verb} {} ({}/{})",
            self.claimants.join(", "),
            self.claimants.len(),
            self.claim_limit
        )
    }

    /// Edits the original announcement, if one was attached.
    pub fn publish(&self, channel: &dyn DropChannel) -> Result<(), ChannelError> {
        match &self.message {
            Some(handle) => channel.edit(handle, &self.render_text()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    /// 1-based slot the claimer took.
    pub position: usize,
    pub newly_added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionOutcome>,
    /// Completion detection failed after the piece was saved. The piece is kept; run
    /// `DropAdmin::check_completion` for this user and puzzle to catch up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_error: Option<String>,
    /// Present on exactly one receipt per session: the claim that filled it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized: Option<SessionSummary>,
}

struct SessionState {
    status: SessionStatus,
    claimants: Vec<UserId>,
}

/// One live drop: a piece offered to the first `claim_limit` claimers until `deadline`.
///
/// Claims and expiry share one lock, so the claimant list, the limit check and the
/// terminal transition always happen together. The ownership write happens under that
/// lock too; a claim is only recorded once the piece is durably saved.
pub struct DropSession {
    id: Uuid,
    channel_id: ChannelId,
    slug: String,
    puzzle_name: String,
    piece_id: PieceId,
    claim_limit: u32,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    state: Mutex<SessionState>,
    message: OnceLock<MessageHandle>,
}

impl DropSession {
    pub fn new(
        channel_id: impl Into<ChannelId>,
        slug: impl Into<String>,
        puzzle_name: impl Into<String>,
        piece_id: PieceId,
        claim_limit: u32,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            slug: slug.into(),
            puzzle_name: puzzle_name.into(),
            piece_id,
            claim_limit: claim_limit.max(1),
            created_at,
            deadline: created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            state: Mutex::new(SessionState {
                status: SessionStatus::Open,
                claimants: Vec::new(),
            }),
            message: OnceLock::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn puzzle_name(&self) -> &str {
        &self.puzzle_name
    }

    pub fn piece_id(&self) -> PieceId {
        self.piece_id
    }

    pub fn claim_limit(&self) -> u32 {
        self.claim_limit
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    pub fn claimants(&self) -> Vec<UserId> {
        self.lock_state().claimants.clone()
    }

    pub fn remaining_slots(&self) -> u32 {
        let state = self.lock_state();
        if state.status.is_terminal() {
            return 0;
        }
        let taken = u32::try_from(state.claimants.len()).unwrap_or(u32::MAX);
        self.claim_limit.saturating_sub(taken)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn message(&self) -> Option<&MessageHandle> {
        self.message.get()
    }

    /// Records where the drop was announced. Only the first handle sticks.
    pub fn attach_message(&self, handle: MessageHandle) {
        let _ = self.message.set(handle);
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.lock_state();
        self.summary_from(&state)
    }

    pub fn attempt_claim(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        ledger: &PieceLedger,
        detector: &CompletionDetector,
    ) -> Result<ClaimReceipt, SessionError> {
        let mut state = self.lock_state();
        if let Err(err) = self.check_claim(&state, user_id, now) {
            debug!(
                event = "claim_rejected",
                session_id = %self.id,
                user_id,
                reason = %err
            );
            return Err(err.into());
        }

        let newly_added = ledger.add_piece(user_id, &self.slug, self.piece_id)?;
        state.claimants.push(user_id.to_string());
        let position = state.claimants.len();
        info!(
            event = "claim_accepted",
            session_id = %self.id,
            user_id,
            puzzle = %self.slug,
            piece_id = self.piece_id,
            position,
            newly_added
        );

        let (completion, completion_error) = if newly_added {
            match detector.on_piece_added(user_id, &self.slug, now) {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => {
                    warn!(
                        event = "completion_check_failed",
                        user_id,
                        puzzle = %self.slug,
                        error = %err
                    );
                    (None, Some(err.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let finalized = if position >= self.claim_limit as usize {
            state.status = SessionStatus::Completed;
            info!(
                event = "session_completed",
                session_id = %self.id,
                claimants = position
            );
            Some(self.summary_from(&state))
        } else {
            None
        };

        Ok(ClaimReceipt {
            position,
            newly_added,
            completion,
            completion_error,
            finalized,
        })
    }

    /// Closes an open session. Returns the summary to publish, or `None` if the session
    /// had already ended.
    pub fn expire(&self) -> Option<SessionSummary> {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return None;
        }
        state.status = SessionStatus::Expired;
        info!(
            event = "session_expired",
            session_id = %self.id,
            claimants = state.claimants.len()
        );
        Some(self.summary_from(&state))
    }

    fn check_claim(
        &self,
        state: &SessionState,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ClaimError> {
        if state.status != SessionStatus::Open {
            return Err(ClaimError::NotOpen(state.status));
        }
        if self.is_expired_at(now) {
            return Err(ClaimError::Expired);
        }
        if state.claimants.iter().any(|claimant| claimant == user_id) {
            return Err(ClaimError::AlreadyClaimed);
        }
        Ok(())
    }

    fn summary_from(&self, state: &SessionState) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            channel_id: self.channel_id.clone(),
            slug: self.slug.clone(),
            puzzle_name: self.puzzle_name.clone(),
            piece_id: self.piece_id,
            claim_limit: self.claim_limit,
            status: state.status,
            claimants: state.claimants.clone(),
            message: self.message.get().cloned(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
