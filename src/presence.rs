//! Presence — advisory "who is here, in which view".
//!
//! Entries are keyed by `(user_id, view)`, refreshed by heartbeat, and
//! considered gone once `now - last_seen_at` exceeds the TTL. Unlike leases
//! they grant nothing; a stale roster only means a stale indicator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::change::{Change, now_ms};
use crate::shape::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    /// Logical sub-view the user is in.
    pub view: String,
    pub last_seen_at: i64,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, view: impl Into<String>, now: i64) -> Self {
        Self { user_id: user_id.into(), view: view.into(), last_seen_at: now }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: i64, ttl_ms: i64) -> bool {
        now - self.last_seen_at > ttl_ms
    }

    fn key(&self) -> (UserId, String) {
        (self.user_id.clone(), self.view.clone())
    }
}

type Roster = HashMap<(UserId, String), PresenceEntry>;

/// This session's presence plus the roster of everyone else's.
#[derive(Clone)]
pub struct PresenceTracker {
    backend: Arc<dyn Backend>,
    user_id: UserId,
    ttl_ms: i64,
    view: Arc<Mutex<Option<String>>>,
    roster: Arc<Mutex<Roster>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, user_id: impl Into<UserId>, ttl_ms: i64) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
            ttl_ms,
            view: Arc::new(Mutex::new(None)),
            roster: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn roster(&self) -> std::sync::MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_view(&self) -> Option<String> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_view(&self, view: Option<String>) {
        *self.view.lock().unwrap_or_else(PoisonError::into_inner) = view;
    }

    /// View this session is currently present in.
    #[must_use]
    pub fn view(&self) -> Option<String> {
        self.current_view()
    }

    /// Announce this session in `view`.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the entry could not be written.
    pub async fn join(&self, view: &str) -> Result<PresenceEntry, BackendError> {
        self.set_view(Some(view.to_string()));
        self.announce(view, now_ms()).await
    }

    async fn announce(&self, view: &str, now: i64) -> Result<PresenceEntry, BackendError> {
        let entry = PresenceEntry::new(self.user_id.clone(), view, now);
        self.backend.put_presence(&entry).await?;
        self.roster().insert(entry.key(), entry.clone());
        Ok(entry)
    }

    /// Refresh `last_seen_at` for the current view. No-op when not joined.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the entry could not be written.
    pub async fn heartbeat(&self) -> Result<Option<PresenceEntry>, BackendError> {
        let Some(view) = self.current_view() else {
            return Ok(None);
        };
        self.announce(&view, now_ms()).await.map(Some)
    }

    /// Withdraw from the current view.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the entry could not be deleted.
    pub async fn leave(&self) -> Result<(), BackendError> {
        let Some(view) = self.current_view() else {
            return Ok(());
        };
        self.set_view(None);
        self.roster().remove(&(self.user_id.clone(), view.clone()));
        self.backend.delete_presence(&self.user_id, &view).await
    }

    /// Leave the current view and join `view`.
    ///
    /// # Errors
    ///
    /// Returns the backend error from either step.
    pub async fn switch_view(&self, view: &str) -> Result<PresenceEntry, BackendError> {
        if self.current_view().as_deref() == Some(view) {
            return self.announce(view, now_ms()).await;
        }
        self.leave().await?;
        self.join(view).await
    }

    /// Fold a presence change from the feed into the roster. Other changes
    /// are ignored. Returns whether the roster changed.
    pub fn apply_change(&self, change: &Change) -> bool {
        match change {
            Change::PresenceChanged { entry } => {
                self.roster().insert(entry.key(), entry.clone());
                true
            }
            Change::PresenceLeft { user_id, view } => {
                self.roster().remove(&(user_id.clone(), view.clone())).is_some()
            }
            _ => false,
        }
    }

    /// Replace the roster with the backend's current entries.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the collection could not be read.
    pub async fn refresh(&self) -> Result<usize, BackendError> {
        let entries = self.backend.list_presence().await?;
        let mut roster = self.roster();
        roster.clear();
        for entry in entries {
            roster.insert(entry.key(), entry);
        }
        Ok(roster.len())
    }

    /// Live entries, ordered by view then user.
    #[must_use]
    pub fn active_at(&self, now: i64) -> Vec<PresenceEntry> {
        let mut active: Vec<PresenceEntry> = self
            .roster()
            .values()
            .filter(|entry| !entry.is_expired_at(now, self.ttl_ms))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.view.cmp(&b.view).then_with(|| a.user_id.cmp(&b.user_id)));
        active
    }

    #[must_use]
    pub fn active_in(&self, view: &str, now: i64) -> Vec<PresenceEntry> {
        self.active_at(now).into_iter().filter(|e| e.view == view).collect()
    }

    /// Drop expired entries from the local roster. Returns how many went.
    pub fn sweep_expired_at(&self, now: i64) -> usize {
        let ttl = self.ttl_ms;
        let mut roster = self.roster();
        let before = roster.len();
        roster.retain(|_, entry| !entry.is_expired_at(now, ttl));
        before - roster.len()
    }

    /// Heartbeat every `every` until aborted.
    pub fn spawn_heartbeat_task(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                match tracker.heartbeat().await {
                    Ok(Some(entry)) => debug!(view = %entry.view, "presence heartbeat"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "presence heartbeat failed"),
                }
                tracker.sweep_expired_at(now_ms());
            }
        })
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
