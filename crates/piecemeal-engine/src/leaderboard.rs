use piecemeal_core::{ConfigError, DropDocument, FinisherEntry, UserId};
use piecemeal_storage::DocumentStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finisher_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverallEntry {
    pub user_id: UserId,
    pub completed: usize,
    pub pieces: usize,
}

/// Read-only rankings over the committed document.
#[derive(Clone)]
pub struct Leaderboard {
    store: Arc<DocumentStore>,
}

impl Leaderboard {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Users by piece count descending, ties by user id ascending.
    pub fn rank(&self, slug: &str) -> Result<Vec<LeaderboardEntry>, ConfigError> {
        self.store.get(|doc| {
            doc.puzzle(slug)?;
            Ok(rank_document(doc, slug))
        })
    }

    pub fn finishers(&self, slug: &str) -> Result<Vec<FinisherEntry>, ConfigError> {
        self.store.get(|doc| {
            doc.puzzle(slug)?;
            Ok(doc.finishers(slug).to_vec())
        })
    }

    pub fn overall(&self) -> Vec<OverallEntry> {
        self.store.get(overall_document)
    }
}

pub fn rank_document(doc: &DropDocument, slug: &str) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = doc
        .user_pieces
        .iter()
        .filter_map(|(user_id, by_puzzle)| {
            let count = by_puzzle.get(slug).map(Vec::len).unwrap_or(0);
            (count > 0).then(|| LeaderboardEntry {
                user_id: user_id.clone(),
                count,
                finisher_position: doc.finisher_position(user_id, slug),
            })
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.user_id.cmp(&b.user_id)));
    entries
}

pub fn overall_document(doc: &DropDocument) -> Vec<OverallEntry> {
    let mut totals: BTreeMap<&str, OverallEntry> = BTreeMap::new();
    for (user_id, by_puzzle) in &doc.user_pieces {
        let pieces: usize = by_puzzle
            .iter()
            .filter(|(slug, _)| doc.puzzles.contains_key(slug.as_str()))
            .map(|(_, owned)| owned.len())
            .sum();
        if pieces > 0 {
            entry_for(&mut totals, user_id).pieces = pieces;
        }
    }
    for (user_id, by_puzzle) in &doc.completions {
        let completed = by_puzzle
            .iter()
            .filter(|(slug, flag)| flag.completed && doc.puzzles.contains_key(slug.as_str()))
            .count();
        if completed > 0 {
            entry_for(&mut totals, user_id).completed = completed;
        }
    }

    let mut entries: Vec<OverallEntry> = totals.into_values().collect();
    entries.sort_by(|a, b| {
        b.completed
            .cmp(&a.completed)
            .then_with(|| b.pieces.cmp(&a.pieces))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    entries
}

fn entry_for<'m, 'a>(
    totals: &'m mut BTreeMap<&'a str, OverallEntry>,
    user_id: &'a str,
) -> &'m mut OverallEntry {
    totals.entry(user_id).or_insert_with(|| OverallEntry {
        user_id: user_id.to_string(),
        completed: 0,
        pieces: 0,
    })
}
