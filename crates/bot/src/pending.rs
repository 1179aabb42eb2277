//! Login attempts parked while the portal waits for a one-time code.
//!
//! Each entry leases a live automation session. Whatever path removes an
//! entry (consume, expiry, shutdown) also closes that session.

use replydesk_browser::AutomationSession;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

pub struct PendingLogin {
    pub attempt_id: Uuid,
    pub identity: String,
    pub created_at: Instant,
    pub session: Box<dyn AutomationSession>,
}

impl PendingLogin {
    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

pub struct PendingRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, PendingLogin>>,
}

impl PendingRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingLogin>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park `session` under a freshly minted v4 id.
    pub fn insert(&self, identity: &str, session: Box<dyn AutomationSession>) -> Uuid {
        let attempt_id = Uuid::new_v4();
        let entry = PendingLogin {
            attempt_id,
            identity: identity.to_string(),
            created_at: Instant::now(),
            session,
        };
        self.lock().insert(attempt_id, entry);
        debug!(%attempt_id, identity, "Pending login registered");
        attempt_id
    }

    /// Remove and return a live attempt. An expired entry is released and
    /// reported as absent.
    pub async fn take(&self, attempt_id: Uuid) -> Option<PendingLogin> {
        let entry = self.lock().remove(&attempt_id)?;
        if entry.expired(self.ttl, Instant::now()) {
            release(entry).await;
            return None;
        }
        Some(entry)
    }

    /// Drop entries older than the TTL, closing their sessions.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingLogin> = {
            let mut entries = self.lock();
            let ids: Vec<Uuid> = entries
                .values()
                .filter(|e| e.expired(self.ttl, now))
                .map(|e| e.attempt_id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = expired.len();
        for entry in expired {
            release(entry).await;
        }
        if count > 0 {
            info!(count, "Reaped expired login attempts");
        }
        count
    }

    /// Release every held session.
    pub async fn drain(&self) -> usize {
        let all: Vec<PendingLogin> = self.lock().drain().map(|(_, e)| e).collect();
        let count = all.len();
        for entry in all {
            release(entry).await;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn release(mut entry: PendingLogin) {
    debug!(attempt_id = %entry.attempt_id, identity = %entry.identity, "Releasing pending login");
    entry.session.close().await;
}
