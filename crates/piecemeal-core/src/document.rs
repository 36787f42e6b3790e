use crate::channel::{DropChannelConfig, PuzzleTarget};
use crate::error::ConfigError;
use crate::puzzle::Puzzle;
use crate::{ChannelId, PieceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DOCUMENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinisherEntry {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionFlag {
    pub completed: bool,
    #[serde(default)]
    pub reward_granted: bool,
    /// Saved before a grant is attempted and cleared once its result is saved. Still set
    /// means the outcome of that grant is unknown.
    #[serde(default)]
    pub reward_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The whole persisted state: one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropDocument {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub puzzles: BTreeMap<String, Puzzle>,
    #[serde(default)]
    pub pieces: BTreeMap<String, BTreeMap<PieceId, String>>,
    #[serde(default)]
    pub user_pieces: BTreeMap<UserId, BTreeMap<String, Vec<PieceId>>>,
    #[serde(default)]
    pub puzzle_finishers: BTreeMap<String, Vec<FinisherEntry>>,
    #[serde(default)]
    pub completions: BTreeMap<UserId, BTreeMap<String, CompletionFlag>>,
    #[serde(default)]
    pub drop_channels: BTreeMap<ChannelId, DropChannelConfig>,
}

impl DropDocument {
    pub fn new() -> Self {
        Self {
            schema_version: DOCUMENT_SCHEMA_VERSION,
            ..Self::default()
        }
    }

    /// Brings an older document up to the current schema in place.
    pub fn upgrade(&mut self) {
        if self.schema_version < 1 {
            for owned in self
                .user_pieces
                .values_mut()
                .flat_map(|by_puzzle| by_puzzle.values_mut())
            {
                owned.sort_unstable();
                owned.dedup();
            }
            for entries in self.puzzle_finishers.values_mut() {
                let mut seen = std::collections::BTreeSet::new();
                entries.retain(|entry| seen.insert(entry.user_id.clone()));
            }
        }
        self.schema_version = DOCUMENT_SCHEMA_VERSION;
    }

    pub fn puzzle(&self, slug: &str) -> Result<&Puzzle, ConfigError> {
        self.puzzles
            .get(slug)
            .ok_or_else(|| ConfigError::UnknownPuzzle(slug.to_string()))
    }

    pub fn channel(&self, channel_id: &str) -> Result<&DropChannelConfig, ConfigError> {
        self.drop_channels
            .get(channel_id)
            .ok_or_else(|| ConfigError::UnknownChannel(channel_id.to_string()))
    }

    pub fn piece_assets(&self, slug: &str) -> Option<&BTreeMap<PieceId, String>> {
        self.pieces.get(slug)
    }

    pub fn piece_asset(&self, slug: &str, piece_id: PieceId) -> Option<&str> {
        self.pieces
            .get(slug)
            .and_then(|assets| assets.get(&piece_id))
            .map(String::as_str)
    }

    pub fn owned(&self, user_id: &str, slug: &str) -> &[PieceId] {
        self.user_pieces
            .get(user_id)
            .and_then(|by_puzzle| by_puzzle.get(slug))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn completion(&self, user_id: &str, slug: &str) -> Option<&CompletionFlag> {
        self.completions
            .get(user_id)
            .and_then(|by_puzzle| by_puzzle.get(slug))
    }

    pub fn completion_mut(&mut self, user_id: &str, slug: &str) -> &mut CompletionFlag {
        self.completions
            .entry(user_id.to_string())
            .or_default()
            .entry(slug.to_string())
            .or_default()
    }

    pub fn finishers(&self, slug: &str) -> &[FinisherEntry] {
        self.puzzle_finishers
            .get(slug)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn finisher_position(&self, user_id: &str, slug: &str) -> Option<usize> {
        self.finishers(slug)
            .iter()
            .position(|entry| entry.user_id == user_id)
            .map(|index| index + 1)
    }

    /// Enabled puzzles that can actually be dropped, in slug order.
    pub fn droppable_puzzles(&self) -> Vec<&str> {
        self.puzzles
            .iter()
            .filter(|(slug, puzzle)| {
                puzzle.enabled
                    && self
                        .pieces
                        .get(slug.as_str())
                        .is_some_and(|assets| !assets.is_empty())
            })
            .map(|(slug, _)| slug.as_str())
            .collect()
    }

    /// Checks that a specific slug can be dropped. `Any` targets resolve in the scheduler.
    pub fn check_droppable(&self, target: &PuzzleTarget) -> Result<(), ConfigError> {
        match target {
            PuzzleTarget::Any => {
                if self.droppable_puzzles().is_empty() {
                    Err(ConfigError::NoEnabledPuzzles)
                } else {
                    Ok(())
                }
            }
            PuzzleTarget::Specific(slug) => {
                self.puzzle(slug)?;
                match self.pieces.get(slug) {
                    Some(assets) if !assets.is_empty() => Ok(()),
                    _ => Err(ConfigError::EmptyPieceMap(slug.clone())),
                }
            }
        }
    }
}
