use crate::collaborators::RewardGranter;
use chrono::{DateTime, Utc};
use piecemeal_core::{ConfigError, FinisherEntry};
use piecemeal_storage::{DocumentStore, StorageError};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{user_id} has not completed {slug}")]
    NotComplete { user_id: String, slug: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RewardStatus {
    NotConfigured,
    Granted,
    AlreadyGranted,
    Failed(String),
    /// A grant was attempted but its result was never saved. Retries are refused until
    /// an operator settles it with `resolve_reward`.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Incomplete { owned: usize, total: u32 },
    AlreadyRecorded,
    Completed {
        finisher_position: usize,
        reward: RewardStatus,
    },
}

enum Recorded {
    Incomplete { owned: usize, total: u32 },
    Already,
    New {
        finisher_position: usize,
        reward_ref: Option<String>,
    },
}

/// Detects full sets and issues the one-time completion effects.
///
/// The completion flag, finisher entry and reward flags are all persisted, so calling
/// `on_piece_added` or `retry_reward` again after a success never repeats an effect.
/// A grant is bracketed by two writes: `reward_pending` is saved before the granter
/// runs and cleared together with `reward_granted` afterwards.
pub struct CompletionDetector {
    store: Arc<DocumentStore>,
    rewards: Arc<dyn RewardGranter>,
    reward_lock: Mutex<()>,
}

impl CompletionDetector {
    pub fn new(store: Arc<DocumentStore>, rewards: Arc<dyn RewardGranter>) -> Self {
        Self {
            store,
            rewards,
            reward_lock: Mutex::new(()),
        }
    }

    pub fn is_complete(&self, user_id: &str, slug: &str) -> Result<bool, ConfigError> {
        self.store.get(|doc| {
            let puzzle = doc.puzzle(slug)?;
            Ok(puzzle.is_complete_with(doc.owned(user_id, slug).len()))
        })
    }

    /// Runs after an `add_piece` that returned `added = true`.
    pub fn on_piece_added(
        &self,
        user_id: &str,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, CompletionError> {
        let recorded = self.store.mutate(|doc| {
            let puzzle = doc.puzzle(slug)?;
            let total = puzzle.piece_count;
            let reward_ref = puzzle.reward_ref.clone();
            let owned = doc.owned(user_id, slug).len();
            if !puzzle.is_complete_with(owned) {
                return Ok::<_, CompletionError>(Recorded::Incomplete { owned, total });
            }
            if doc
                .completion(user_id, slug)
                .is_some_and(|flag| flag.completed)
            {
                return Ok(Recorded::Already);
            }

            let finishers = doc.puzzle_finishers.entry(slug.to_string()).or_default();
            if !finishers.iter().any(|entry| entry.user_id == user_id) {
                finishers.push(FinisherEntry {
                    user_id: user_id.to_string(),
                    finished_at: Some(now),
                });
            }
            let finisher_position = doc
                .finisher_position(user_id, slug)
                .unwrap_or_else(|| doc.finishers(slug).len());

            let flag = doc.completion_mut(user_id, slug);
            flag.completed = true;
            flag.completed_at = Some(now);

            Ok(Recorded::New {
                finisher_position,
                reward_ref,
            })
        })?;

        match recorded {
            Recorded::Incomplete { owned, total } => {
                Ok(CompletionOutcome::Incomplete { owned, total })
            }
            Recorded::Already => Ok(CompletionOutcome::AlreadyRecorded),
            Recorded::New {
                finisher_position,
                reward_ref,
            } => {
                info!(
                    event = "puzzle_completed",
                    user_id,
                    puzzle = slug,
                    finisher_position
                );
                let _guard = self.reward_lock.lock().unwrap_or_else(PoisonError::into_inner);
                let reward = match self.grant_once(user_id, slug, reward_ref) {
                    Ok(reward) => reward,
                    Err(err) => {
                        warn!(
                            event = "reward_not_attempted",
                            user_id,
                            puzzle = slug,
                            error = %err
                        );
                        RewardStatus::Failed(format!("not attempted: {err}"))
                    }
                };
                Ok(CompletionOutcome::Completed {
                    finisher_position,
                    reward,
                })
            }
        }
    }

    /// Explicit re-trigger for a grant that failed earlier. Safe to call repeatedly.
    pub fn retry_reward(&self, user_id: &str, slug: &str) -> Result<RewardStatus, CompletionError> {
        let _guard = self.reward_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (completed, reward_ref) = self.store.get(|doc| {
            let puzzle = doc.puzzle(slug)?;
            Ok::<_, ConfigError>((
                doc.completion(user_id, slug).is_some_and(|flag| flag.completed),
                puzzle.reward_ref.clone(),
            ))
        })?;
        if !completed {
            return Err(CompletionError::NotComplete {
                user_id: user_id.to_string(),
                slug: slug.to_string(),
            });
        }
        self.grant_once(user_id, slug, reward_ref)
    }

    /// Settles an `Unconfirmed` grant once an operator has checked the reward system.
    /// `granted = false` makes the reward eligible for `retry_reward` again. Returns
    /// false when nothing was pending.
    pub fn resolve_reward(
        &self,
        user_id: &str,
        slug: &str,
        granted: bool,
    ) -> Result<bool, CompletionError> {
        let _guard = self.reward_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let settled = self.store.mutate(|doc| {
            doc.puzzle(slug)?;
            let flag = doc.completion_mut(user_id, slug);
            if !flag.completed {
                return Err(CompletionError::NotComplete {
                    user_id: user_id.to_string(),
                    slug: slug.to_string(),
                });
            }
            if !flag.reward_pending {
                return Ok(false);
            }
            flag.reward_pending = false;
            flag.reward_granted = granted;
            Ok(true)
        })?;
        if settled {
            info!(event = "reward_resolved", user_id, puzzle = slug, granted);
        }
        Ok(settled)
    }

    // Caller holds reward_lock.
    fn grant_once(
        &self,
        user_id: &str,
        slug: &str,
        reward_ref: Option<String>,
    ) -> Result<RewardStatus, CompletionError> {
        let Some(reward_ref) = reward_ref else {
            return Ok(RewardStatus::NotConfigured);
        };
        let blocked = self.store.mutate(|doc| {
            let flag = doc.completion_mut(user_id, slug);
            if flag.reward_granted {
                return Ok::<_, StorageError>(Some(RewardStatus::AlreadyGranted));
            }
            if flag.reward_pending {
                return Ok(Some(RewardStatus::Unconfirmed));
            }
            flag.reward_pending = true;
            Ok(None)
        })?;
        if let Some(status) = blocked {
            return Ok(status);
        }

        let (status, granted) = match self.rewards.grant(user_id, slug, &reward_ref) {
            Ok(()) => (RewardStatus::Granted, true),
            Err(err) => {
                warn!(event = "reward_failed", user_id, puzzle = slug, error = %err);
                (RewardStatus::Failed(err.reason), false)
            }
        };
        let saved = self.store.mutate(|doc| {
            let flag = doc.completion_mut(user_id, slug);
            flag.reward_pending = false;
            flag.reward_granted = granted;
            Ok::<_, StorageError>(())
        });
        match saved {
            Ok(()) => {
                if granted {
                    info!(event = "reward_granted", user_id, puzzle = slug, reward = %reward_ref);
                }
                Ok(status)
            }
            Err(err) => {
                error!(
                    event = "reward_unconfirmed",
                    user_id,
                    puzzle = slug,
                    granted,
                    error = %err
                );
                Ok(RewardStatus::Unconfirmed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::RecordingRewards;
    use crate::collaborators::RewardError;
    use chrono::TimeZone;
    use piecemeal_core::Puzzle;
    use piecemeal_storage::PieceLedger;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, min, 0)
            .single()
            .expect("valid timestamp")
    }

    type Setup = (
        Arc<DocumentStore>,
        PieceLedger,
        Arc<RecordingRewards>,
        CompletionDetector,
    );

    fn demo(reward: Option<&str>) -> Puzzle {
        Puzzle {
            display_name: "Demo".to_string(),
            piece_count: 4,
            rows: 2,
            cols: 2,
            base_image_ref: "demo/base.png".to_string(),
            full_image_ref: "demo/full.png".to_string(),
            reward_ref: reward.map(str::to_string),
            enabled: true,
        }
    }

    fn seed(store: &DocumentStore, reward: Option<&str>) {
        store
            .mutate(|doc| {
                doc.puzzles.insert("demo".to_string(), demo(reward));
                Ok::<_, StorageError>(())
            })
            .expect("seed puzzle");
    }

    fn setup(reward: Option<&str>) -> Setup {
        let store = Arc::new(DocumentStore::in_memory());
        seed(&store, reward);
        let rewards = Arc::new(RecordingRewards::default());
        let detector = CompletionDetector::new(store.clone(), rewards.clone());
        (store.clone(), PieceLedger::new(store), rewards, detector)
    }

    #[test]
    fn fourth_piece_records_one_finisher() {
        let (store, ledger, rewards, detector) = setup(Some("role:finisher"));
        for id in 1..=3 {
            ledger.add_piece("alice", "demo", id).expect("add");
            assert!(matches!(
                detector.on_piece_added("alice", "demo", ts(0)).expect("detect"),
                CompletionOutcome::Incomplete { .. }
            ));
        }
        assert!(!detector.is_complete("alice", "demo").expect("check"));

        assert!(ledger.add_piece("alice", "demo", 4).expect("add last"));
        assert!(detector.is_complete("alice", "demo").expect("check"));
        let outcome = detector
            .on_piece_added("alice", "demo", ts(1))
            .expect("detect completion");
        assert_eq!(
            outcome,
            CompletionOutcome::Completed {
                finisher_position: 1,
                reward: RewardStatus::Granted,
            }
        );

        let again = detector
            .on_piece_added("alice", "demo", ts(2))
            .expect("detect again");
        assert_eq!(again, CompletionOutcome::AlreadyRecorded);

        assert_eq!(store.get(|doc| doc.finishers("demo").len()), 1);
        assert_eq!(rewards.grants.lock().expect("grants").len(), 1);
        let flag = store
            .get(|doc| doc.completion("alice", "demo").cloned())
            .expect("flag set");
        assert!(flag.completed && flag.reward_granted);
        assert_eq!(flag.completed_at, Some(ts(1)));
    }

    #[test]
    fn failed_grant_keeps_completion_and_retries_explicitly() {
        let (store, ledger, rewards, detector) = setup(Some("role:finisher"));
        rewards.fail.store(true, Ordering::SeqCst);
        for id in 1..=4 {
            ledger.add_piece("bob", "demo", id).expect("add");
        }
        let outcome = detector.on_piece_added("bob", "demo", ts(0)).expect("detect");
        assert_eq!(
            outcome,
            CompletionOutcome::Completed {
                finisher_position: 1,
                reward: RewardStatus::Failed("member missing".to_string()),
            }
        );
        assert!(store.get(|doc| doc
            .completion("bob", "demo")
            .is_some_and(|flag| flag.completed && !flag.reward_pending)));
        assert_eq!(ledger.owned_count("bob", "demo"), 4);

        // a repeat detection never retries inline
        assert_eq!(
            detector.on_piece_added("bob", "demo", ts(1)).expect("detect"),
            CompletionOutcome::AlreadyRecorded
        );
        assert!(rewards.grants.lock().expect("grants").is_empty());

        rewards.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            detector.retry_reward("bob", "demo").expect("retry"),
            RewardStatus::Granted
        );
        assert_eq!(
            detector.retry_reward("bob", "demo").expect("retry again"),
            RewardStatus::AlreadyGranted
        );
        assert_eq!(rewards.grants.lock().expect("grants").len(), 1);
    }

    /// Grants succeed, but the first one turns the data directory into a plain file so
    /// the write that records the grant fails.
    struct StoreBreakingRewards {
        data_dir: PathBuf,
        grants: AtomicUsize,
    }

    impl RewardGranter for StoreBreakingRewards {
        fn grant(&self, _user_id: &str, _slug: &str, _reward_ref: &str) -> Result<(), RewardError> {
            if self.grants.fetch_add(1, Ordering::SeqCst) == 0 {
                fs::remove_dir_all(&self.data_dir).expect("remove data dir");
                fs::write(&self.data_dir, b"blocked").expect("block data dir");
            }
            Ok(())
        }
    }

    #[test]
    fn unsaved_grant_is_never_repeated() {
        let dir = tempdir().expect("tempdir");
        let data_dir = dir.path().join("data");
        let store = Arc::new(DocumentStore::open(data_dir.join("drops.json")).expect("open"));
        seed(&store, Some("role:finisher"));
        let ledger = PieceLedger::new(store.clone());
        for id in 1..=4 {
            ledger.add_piece("dana", "demo", id).expect("add");
        }
        let rewards = Arc::new(StoreBreakingRewards {
            data_dir: data_dir.clone(),
            grants: AtomicUsize::new(0),
        });
        let detector = CompletionDetector::new(store.clone(), rewards.clone());

        let outcome = detector.on_piece_added("dana", "demo", ts(0)).expect("detect");
        assert_eq!(
            outcome,
            CompletionOutcome::Completed {
                finisher_position: 1,
                reward: RewardStatus::Unconfirmed,
            }
        );

        fs::remove_file(&data_dir).expect("unblock data dir");
        assert_eq!(
            detector.retry_reward("dana", "demo").expect("retry"),
            RewardStatus::Unconfirmed
        );
        assert_eq!(rewards.grants.load(Ordering::SeqCst), 1);

        assert!(detector.resolve_reward("dana", "demo", true).expect("resolve"));
        assert!(!detector.resolve_reward("dana", "demo", true).expect("resolve again"));
        assert_eq!(
            detector.retry_reward("dana", "demo").expect("retry after resolve"),
            RewardStatus::AlreadyGranted
        );
        assert_eq!(rewards.grants.load(Ordering::SeqCst), 1);

        let reopened = DocumentStore::open(data_dir.join("drops.json")).expect("reopen");
        let flag = reopened
            .get(|doc| doc.completion("dana", "demo").cloned())
            .expect("flag saved");
        assert!(flag.completed && flag.reward_granted && !flag.reward_pending);
    }

    #[test]
    fn resolving_as_not_granted_reopens_retry() {
        let (store, ledger, rewards, detector) = setup(Some("role:finisher"));
        for id in 1..=4 {
            ledger.add_piece("erin", "demo", id).expect("add");
        }
        store
            .mutate(|doc| {
                let flag = doc.completion_mut("erin", "demo");
                flag.completed = true;
                flag.reward_pending = true;
                Ok::<_, StorageError>(())
            })
            .expect("leave grant pending");

        assert_eq!(
            detector.retry_reward("erin", "demo").expect("blocked retry"),
            RewardStatus::Unconfirmed
        );
        assert!(detector.resolve_reward("erin", "demo", false).expect("resolve"));
        assert_eq!(
            detector.retry_reward("erin", "demo").expect("retry"),
            RewardStatus::Granted
        );
        assert_eq!(rewards.grants.lock().expect("grants").len(), 1);
    }

    #[test]
    fn retry_requires_completion() {
        let (_store, ledger, _rewards, detector) = setup(Some("role:finisher"));
        ledger.add_piece("carol", "demo", 1).expect("add");
        assert!(matches!(
            detector.retry_reward("carol", "demo"),
            Err(CompletionError::NotComplete { .. })
        ));
    }

    #[test]
    fn finishers_keep_completion_order() {
        let (store, ledger, _rewards, detector) = setup(None);
        for user in ["bob", "alice"] {
            for id in 1..=4 {
                ledger.add_piece(user, "demo", id).expect("add");
            }
            let outcome = detector.on_piece_added(user, "demo", ts(0)).expect("detect");
            assert!(matches!(
                outcome,
                CompletionOutcome::Completed {
                    reward: RewardStatus::NotConfigured,
                    ..
                }
            ));
        }
        let order: Vec<String> = store.get(|doc| {
            doc.finishers("demo")
                .iter()
                .map(|entry| entry.user_id.clone())
                .collect()
        });
        assert_eq!(order, vec!["bob".to_string(), "alice".to_string()]);
    }

    #[test]
    fn unknown_puzzle_is_config_error() {
        let (_store, _ledger, _rewards, detector) = setup(None);
        assert!(matches!(
            detector.on_piece_added("alice", "nope", ts(0)),
            Err(CompletionError::Config(ConfigError::UnknownPuzzle(_)))
        ));
    }
}
