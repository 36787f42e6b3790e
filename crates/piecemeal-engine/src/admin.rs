use crate::completion::{CompletionDetector, CompletionError, CompletionOutcome, RewardStatus};
use crate::scheduler::{DropScheduler, SchedulerError, SpawnedDrop};
use chrono::{DateTime, Utc};
use piecemeal_core::{validate_document, ConfigError, PieceId, UserId};
use piecemeal_storage::{PieceLedger, StorageError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WipeTarget {
    User(UserId),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantOutcome {
    pub added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionOutcome>,
}

/// Operator actions over the same components the drop flow uses.
pub struct DropAdmin {
    ledger: PieceLedger,
    detector: Arc<CompletionDetector>,
    scheduler: Arc<DropScheduler>,
}

impl DropAdmin {
    pub fn new(
        ledger: PieceLedger,
        detector: Arc<CompletionDetector>,
        scheduler: Arc<DropScheduler>,
    ) -> Self {
        Self {
            ledger,
            detector,
            scheduler,
        }
    }

    /// Grants a piece as if it had been claimed, including completion effects.
    pub fn grant_piece(
        &self,
        user_id: &str,
        slug: &str,
        piece_id: PieceId,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome, AdminError> {
        self.ledger
            .store()
            .get(|doc| doc.puzzle(slug)?.check_piece(slug, piece_id))?;
        let added = self.ledger.add_piece(user_id, slug, piece_id)?;
        let completion = if added {
            Some(self.detector.on_piece_added(user_id, slug, now)?)
        } else {
            None
        };
        info!(event = "admin_grant", user_id, puzzle = slug, piece_id, added);
        Ok(GrantOutcome { added, completion })
    }

    pub fn revoke_piece(
        &self,
        user_id: &str,
        slug: &str,
        piece_id: PieceId,
    ) -> Result<bool, AdminError> {
        self.ledger.store().get(|doc| doc.puzzle(slug).map(|_| ()))?;
        let removed = self.ledger.remove_piece(user_id, slug, piece_id)?;
        info!(event = "admin_revoke", user_id, puzzle = slug, piece_id, removed);
        Ok(removed)
    }

    /// Clears ownership. Completion flags and the finisher record are history and stay.
    pub fn wipe(&self, slug: &str, target: &WipeTarget) -> Result<usize, AdminError> {
        self.ledger.store().get(|doc| doc.puzzle(slug).map(|_| ()))?;
        let affected = match target {
            WipeTarget::User(user_id) => self.ledger.wipe_for_user(user_id, slug)?,
            WipeTarget::All => self.ledger.wipe_for_all(slug)?,
        };
        Ok(affected)
    }

    /// Every problem in the persisted configuration. Empty means valid.
    pub fn validate_config(&self) -> Vec<ConfigError> {
        self.ledger.store().get(validate_document)
    }

    pub fn force_spawn(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SpawnedDrop, AdminError> {
        Ok(self.scheduler.force_spawn(channel_id, now)?)
    }

    pub fn retry_reward(&self, user_id: &str, slug: &str) -> Result<RewardStatus, AdminError> {
        Ok(self.detector.retry_reward(user_id, slug)?)
    }

    /// Records the operator's verdict on an `Unconfirmed` reward grant.
    pub fn resolve_reward(
        &self,
        user_id: &str,
        slug: &str,
        granted: bool,
    ) -> Result<bool, AdminError> {
        Ok(self.detector.resolve_reward(user_id, slug, granted)?)
    }

    /// Re-runs completion detection, e.g. after pieces were edited by hand.
    pub fn check_completion(
        &self,
        user_id: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, AdminError> {
        Ok(self.detector.on_piece_added(user_id, slug, now)?)
    }
}
