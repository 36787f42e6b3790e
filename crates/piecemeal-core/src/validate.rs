use crate::channel::PuzzleTarget;
use crate::document::DropDocument;
use crate::error::ConfigError;

/// Collects every configuration problem in the document instead of stopping at the first.
pub fn validate_document(doc: &DropDocument) -> Vec<ConfigError> {
    let mut issues = Vec::new();

    for (slug, puzzle) in &doc.puzzles {
        if let Err(err) = puzzle.validate(slug) {
            issues.push(err);
            continue;
        }
        match doc.pieces.get(slug) {
            None => issues.push(ConfigError::EmptyPieceMap(slug.clone())),
            Some(assets) if assets.is_empty() => {
                issues.push(ConfigError::EmptyPieceMap(slug.clone()))
            }
            Some(assets) => {
                for piece_id in assets.keys() {
                    if let Err(err) = puzzle.check_piece(slug, *piece_id) {
                        issues.push(err);
                    }
                }
            }
        }
    }

    for slug in doc.pieces.keys() {
        if !doc.puzzles.contains_key(slug) {
            issues.push(ConfigError::UnknownPuzzle(slug.clone()));
        }
    }

    for (channel_id, channel) in &doc.drop_channels {
        if let Err(err) = channel.validate(channel_id) {
            issues.push(err);
        }
        match &channel.puzzle {
            PuzzleTarget::Specific(slug) if !doc.puzzles.contains_key(slug) => issues.push(
                ConfigError::malformed(channel_id, format!("targets unknown puzzle {slug}")),
            ),
            PuzzleTarget::Any if doc.droppable_puzzles().is_empty() => issues.push(
                ConfigError::malformed(channel_id, "targets any puzzle but none are droppable"),
            ),
            _ => {}
        }
    }

    for (user_id, by_puzzle) in &doc.user_pieces {
        for (slug, owned) in by_puzzle {
            let Some(puzzle) = doc.puzzles.get(slug) else {
                continue;
            };
            for piece_id in owned {
                if !puzzle.contains_piece(*piece_id) {
                    issues.push(ConfigError::OwnedPieceOutOfRange {
                        user_id: user_id.clone(),
                        slug: slug.clone(),
                        piece_id: *piece_id,
                    });
                }
            }
        }
    }

    issues
}
