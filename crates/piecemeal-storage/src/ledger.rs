use crate::{DocumentStore, StorageError};
use piecemeal_core::{PieceId, UserId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Ownership Store: which pieces each user holds per puzzle.
///
/// Range checks against the puzzle definition are the caller's job. Every mutator is
/// idempotent and returns only after the document has been written.
#[derive(Clone)]
pub struct PieceLedger {
    store: Arc<DocumentStore>,
}

impl PieceLedger {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn add_piece(
        &self,
        user_id: &str,
        slug: &str,
        piece_id: PieceId,
    ) -> Result<bool, StorageError> {
        let added = self.store.mutate(|doc| {
            let owned = doc
                .user_pieces
                .entry(user_id.to_string())
                .or_default()
                .entry(slug.to_string())
                .or_default();
            match owned.binary_search(&piece_id) {
                Ok(_) => Ok::<_, StorageError>(false),
                Err(index) => {
                    owned.insert(index, piece_id);
                    Ok(true)
                }
            }
        })?;
        if added {
            info!(event = "piece_added", user_id, puzzle = slug, piece_id);
        }
        Ok(added)
    }

    pub fn remove_piece(
        &self,
        user_id: &str,
        slug: &str,
        piece_id: PieceId,
    ) -> Result<bool, StorageError> {
        let removed = self.store.mutate(|doc| {
            let Some(owned) = doc
                .user_pieces
                .get_mut(user_id)
                .and_then(|by_puzzle| by_puzzle.get_mut(slug))
            else {
                return Ok::<_, StorageError>(false);
            };
            match owned.binary_search(&piece_id) {
                Ok(index) => {
                    owned.remove(index);
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        })?;
        if removed {
            info!(event = "piece_removed", user_id, puzzle = slug, piece_id);
        }
        Ok(removed)
    }

    /// Clears one user's pieces for a puzzle. Returns how many pieces were dropped.
    pub fn wipe_for_user(&self, user_id: &str, slug: &str) -> Result<usize, StorageError> {
        let removed = self.store.mutate(|doc| {
            let removed = doc
                .user_pieces
                .get_mut(user_id)
                .and_then(|by_puzzle| by_puzzle.remove(slug))
                .map(|owned| owned.len())
                .unwrap_or(0);
            Ok::<_, StorageError>(removed)
        })?;
        info!(event = "pieces_wiped", user_id, puzzle = slug, removed);
        Ok(removed)
    }

    /// Clears every user's pieces for a puzzle. Returns how many users were affected.
    pub fn wipe_for_all(&self, slug: &str) -> Result<usize, StorageError> {
        let users = self.store.mutate(|doc| {
            let mut users = 0;
            for by_puzzle in doc.user_pieces.values_mut() {
                if by_puzzle.remove(slug).is_some_and(|owned| !owned.is_empty()) {
                    users += 1;
                }
            }
            Ok::<_, StorageError>(users)
        })?;
        info!(event = "pieces_wiped_all", puzzle = slug, users);
        Ok(users)
    }

    pub fn get_owned(&self, user_id: &str, slug: &str) -> BTreeSet<PieceId> {
        self.store
            .get(|doc| doc.owned(user_id, slug).iter().copied().collect())
    }

    pub fn owned_count(&self, user_id: &str, slug: &str) -> usize {
        self.store.get(|doc| doc.owned(user_id, slug).len())
    }

    /// Every user holding at least one piece of the puzzle, with their counts.
    pub fn holders(&self, slug: &str) -> Vec<(UserId, usize)> {
        self.store.get(|doc| {
            doc.user_pieces
                .iter()
                .filter_map(|(user_id, by_puzzle)| {
                    by_puzzle
                        .get(slug)
                        .filter(|owned| !owned.is_empty())
                        .map(|owned| (user_id.clone(), owned.len()))
                })
                .collect()
        })
    }
}
