use crate::error::ConfigError;
use crate::PieceId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Puzzle {
    pub display_name: String,
    pub piece_count: u32,
    pub rows: u32,
    pub cols: u32,
    pub base_image_ref: String,
    pub full_image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_ref: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridPosition {
    pub row: u32,
    pub col: u32,
}

impl Puzzle {
    pub fn contains_piece(&self, piece_id: PieceId) -> bool {
        piece_id >= 1 && piece_id <= self.piece_count
    }

    /// Row-major cell of a piece: row = (id-1) / cols, col = (id-1) % cols.
    pub fn piece_position(&self, piece_id: PieceId) -> Option<GridPosition> {
        if !self.contains_piece(piece_id) || self.cols == 0 {
            return None;
        }
        let index = piece_id - 1;
        Some(GridPosition {
            row: index / self.cols,
            col: index % self.cols,
        })
    }

    pub fn is_complete_with(&self, owned: usize) -> bool {
        owned as u64 == u64::from(self.piece_count)
    }

    pub fn check_piece(&self, slug: &str, piece_id: PieceId) -> Result<(), ConfigError> {
        if self.contains_piece(piece_id) {
            Ok(())
        } else {
            Err(ConfigError::PieceOutOfRange {
                slug: slug.to_string(),
                piece_id,
                piece_count: self.piece_count,
            })
        }
    }

    pub fn validate(&self, slug: &str) -> Result<(), ConfigError> {
        if slug.trim().is_empty() {
            return Err(ConfigError::invalid_puzzle(slug, "slug is empty"));
        }
        if self.piece_count == 0 {
            return Err(ConfigError::invalid_puzzle(slug, "piece_count must be > 0"));
        }
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::invalid_puzzle(slug, "rows and cols must be > 0"));
        }
        if u64::from(self.rows) * u64::from(self.cols) < u64::from(self.piece_count) {
            return Err(ConfigError::invalid_puzzle(
                slug,
                format!(
                    "{}x{} grid cannot hold {} pieces",
                    self.rows, self.cols, self.piece_count
                ),
            ));
        }
        Ok(())
    }
}
