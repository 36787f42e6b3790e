use crate::{RenderError, RenderedProgress};
use piecemeal_core::PieceId;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Digest of (puzzle, user, sorted owned ids).
pub fn cache_key(slug: &str, user_id: &str, owned: &BTreeSet<PieceId>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(slug.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    for piece_id in owned {
        hasher.update(piece_id.to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

struct CachedRender {
    key: String,
    render: Arc<RenderedProgress>,
}

/// Keeps the latest render per (user, puzzle).
#[derive(Default)]
pub struct RenderCache {
    entries: Mutex<HashMap<(String, String), CachedRender>>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_render<F>(
        &self,
        user_id: &str,
        slug: &str,
        owned: &BTreeSet<PieceId>,
        render: F,
    ) -> Result<Arc<RenderedProgress>, RenderError>
    where
        F: FnOnce() -> Result<RenderedProgress, RenderError>,
    {
        let key = cache_key(slug, user_id, owned);
        let slot = (user_id.to_string(), slug.to_string());
        if let Some(cached) = self.lock().get(&slot) {
            if cached.key == key {
                return Ok(cached.render.clone());
            }
        }

        let rendered = Arc::new(render()?);
        self.lock().insert(
            slot,
            CachedRender {
                key,
                render: rendered.clone(),
            },
        );
        Ok(rendered)
    }

    pub fn invalidate(&self, user_id: &str, slug: &str) {
        self.lock()
            .remove(&(user_id.to_string(), slug.to_string()));
    }

    pub fn invalidate_puzzle(&self, slug: &str) {
        self.lock().retain(|(_, cached_slug), _| cached_slug != slug);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), CachedRender>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
