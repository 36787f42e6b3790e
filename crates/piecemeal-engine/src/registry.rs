use crate::session::{DropSession, SessionSummary};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;
use uuid::Uuid;

/// Live drop sessions, keyed by session id.
#[derive(Default)]
pub struct ActiveDrops {
    sessions: Mutex<HashMap<Uuid, Arc<DropSession>>>,
}

impl ActiveDrops {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<DropSession>) {
        self.lock().insert(session.id(), session);
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Arc<DropSession>> {
        self.lock().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Expires every open session past its deadline and forgets terminal ones.
    /// Returns the summaries of the sessions this call expired.
    pub fn reap(&self, now: DateTime<Utc>) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<DropSession>> = self.lock().values().cloned().collect();
        let mut expired = Vec::new();
        for session in &sessions {
            if session.is_expired_at(now) {
                if let Some(summary) = session.expire() {
                    expired.push(summary);
                }
            }
        }
        let mut live = self.lock();
        let before = live.len();
        live.retain(|_, session| !session.status().is_terminal());
        let removed = before - live.len();
        if removed > 0 {
            info!(event = "sessions_reaped", removed, expired = expired.len());
        }
        expired.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        expired
    }

    /// Administrative expiry. `None` if the session is unknown or already ended.
    pub fn force_expire(&self, session_id: &Uuid) -> Option<SessionSummary> {
        let session = self.lock().remove(session_id)?;
        let summary = session.expire();
        if summary.is_some() {
            info!(event = "session_force_expired", session_id = %session_id);
        }
        summary
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<DropSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
