//! Lock session state machine.
//!
//! The controller is the single gatekeeper: it owns the device's lock
//! state, drives `Unlocked <-> LockedScheduled` transitions from the
//! schedule poll, and rejects account mutations while any session is
//! active. The enforcement layer consumes its status; the mechanism that
//! technically blocks an application is out of scope.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{Snapshot, SnapshotCache};
use crate::error::{LockError, Result};
use crate::ids::Email;
use crate::preset::{check_window_overlap, resolve_active_preset, Preset};
use crate::store::RemoteStore;

/// Is the device restricted, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    /// Explicit lock; never auto-expires. Carries the manual preset
    /// template applied, if any.
    LockedManual {
        preset_id: Option<Uuid>,
        since: DateTime<Utc>,
    },
    /// Activated by schedule; ends when the window elapses or by tapout.
    LockedScheduled { preset_id: Uuid },
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        !matches!(self, LockState::Unlocked)
    }

    pub fn kind(&self) -> Option<SessionKind> {
        match self {
            LockState::Unlocked => None,
            LockState::LockedManual { .. } => Some(SessionKind::Manual),
            LockState::LockedScheduled { .. } => Some(SessionKind::Scheduled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Manual,
    Scheduled,
}

/// Audit record of an emergency tapout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapoutRecord {
    pub interrupted: SessionKind,
    pub preset_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

pub struct LockController {
    account: Email,
    store: Arc<dyn RemoteStore>,
    cache: Arc<SnapshotCache>,
    state: Mutex<LockState>,
    /// Preset whose session was ended early by tapout. Its schedule still
    /// matches, so the poll must not re-activate it until the current
    /// occurrence has passed.
    tapped_out: Mutex<Option<Uuid>>,
}

impl LockController {
    /// Build a controller seeded with the account's current lock state
    /// from the store.
    pub async fn connect(
        account: Email,
        store: Arc<dyn RemoteStore>,
        cache: Arc<SnapshotCache>,
    ) -> Result<Self> {
        let snapshot = cache.get(&account, true).await?;
        Ok(Self {
            account,
            store,
            cache,
            state: Mutex::new(snapshot.lock),
            tapped_out: Mutex::new(None),
        })
    }

    pub fn account(&self) -> &Email {
        &self.account
    }

    /// Current lock state without touching the store.
    pub async fn lock_state(&self) -> LockState {
        self.state.lock().await.clone()
    }

    /// Reject account-mutating operations while a session is active.
    /// Settings changes, card unregistration and preset edits all consult
    /// this before touching the store.
    pub async fn guard_mutation(&self) -> Result<()> {
        if self.state.lock().await.is_locked() {
            return Err(LockError::Locked);
        }
        Ok(())
    }

    /// Current snapshot; `force_refresh` pulls from the store.
    pub async fn status(&self, force_refresh: bool) -> Result<Snapshot> {
        let mut snapshot = self.cache.get(&self.account, force_refresh).await?;
        // The local state machine is authoritative between refreshes.
        snapshot.lock = self.state.lock().await.clone();
        Ok(snapshot)
    }

    /// Explicit manual lock, optionally applying a manual preset template.
    ///
    /// Requires a bound card (a device with no registered card can never
    /// be locked) and a membership that permits locking.
    pub async fn lock_manual(&self, preset_id: Option<Uuid>, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_locked() {
            return Err(LockError::Locked);
        }

        if self.store.binding_get(&self.account).await?.is_none() {
            return Err(LockError::not_found("registered card"));
        }

        let snapshot = self.cache.get(&self.account, false).await?;
        if !snapshot.membership.allows_lock(now) {
            return Err(LockError::validation(
                "membership has lapsed; locking is disabled",
            ));
        }

        if let Some(id) = preset_id {
            let presets = self.store.presets_list(&self.account).await?;
            let preset = presets
                .iter()
                .find(|p| p.id == id)
                .ok_or_else(|| LockError::not_found(format!("preset {id}")))?;
            if !preset.is_manual() {
                return Err(LockError::validation(
                    "only a manual preset can be applied to an explicit lock",
                ));
            }
        }

        let next = LockState::LockedManual {
            preset_id,
            since: now,
        };
        self.store.lock_set(&self.account, &next).await?;
        *state = next.clone();
        drop(state);

        info!(account = %self.account, ?preset_id, "manual lock started");
        self.refresh_cached_lock(next).await;
        Ok(())
    }

    /// Explicit unlock. Only ends a manual session; a scheduled session
    /// runs until its window elapses or a tapout is spent.
    pub async fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match &*state {
            LockState::Unlocked => {
                return Err(LockError::conflict("device is not locked"));
            }
            LockState::LockedScheduled { .. } => {
                return Err(LockError::Locked);
            }
            LockState::LockedManual { .. } => {}
        }

        self.store.lock_set(&self.account, &LockState::Unlocked).await?;
        *state = LockState::Unlocked;
        drop(state);

        info!(account = %self.account, "manual lock ended");
        self.refresh_cached_lock(LockState::Unlocked).await;
        Ok(())
    }

    /// Emergency tapout: consume one quota unit and force `Unlocked`,
    /// recording which session kind was interrupted. A tapped-out
    /// scheduled preset stays ended; the poll will not re-activate it
    /// while the same occurrence still matches.
    ///
    /// The consume is a conditional update at the store; a lost race is
    /// retried once after re-reading, then surfaced as a conflict.
    pub async fn tapout(&self, now: DateTime<Utc>) -> Result<TapoutRecord> {
        let mut state = self.state.lock().await;
        let (interrupted, preset_id) = match &*state {
            LockState::Unlocked => return Err(LockError::conflict("device is not locked")),
            LockState::LockedManual { preset_id, .. } => (SessionKind::Manual, *preset_id),
            LockState::LockedScheduled { preset_id } => (SessionKind::Scheduled, Some(*preset_id)),
        };

        let spent = self.consume_quota(now).await?;

        self.store.lock_set(&self.account, &LockState::Unlocked).await?;
        *state = LockState::Unlocked;
        drop(state);

        if interrupted == SessionKind::Scheduled {
            *self.tapped_out.lock().await = preset_id;
        }

        info!(
            account = %self.account,
            ?interrupted,
            remaining = spent.remaining(),
            "tapout consumed, session ended"
        );

        let issued_at = Utc::now();
        if let Ok(mut snapshot) = self.cache.get(&self.account, false).await {
            snapshot.lock = LockState::Unlocked;
            snapshot.quota = spent;
            snapshot.fetched_at = issued_at;
            snapshot.stale = false;
            self.cache.put_local(&self.account, snapshot).await;
        }

        Ok(TapoutRecord {
            interrupted,
            preset_id,
            at: now,
        })
    }

    async fn consume_quota(&self, now: DateTime<Utc>) -> Result<crate::quota::Quota> {
        for attempt in 0..2 {
            let current = self.store.quota_get(&self.account).await?;
            let mut next = current.clone();
            next.consume(now)?;

            if self.store.quota_cas(&self.account, &current, &next).await? {
                return Ok(next);
            }
            debug!(account = %self.account, attempt, "quota compare-and-set lost, re-reading");
        }
        Err(LockError::conflict(
            "tapout raced with another update; try again",
        ))
    }

    /// One reconciliation cycle, driven by the schedule poll.
    ///
    /// Refreshes the remote snapshot (quota refills settle inside the
    /// fetch, before the lock state is evaluated), resolves the active
    /// preset for `now`, and applies any `Unlocked <-> LockedScheduled`
    /// transition. Manual sessions are untouched.
    pub async fn reconcile<Tz: TimeZone>(&self, now_local: &DateTime<Tz>) -> Result<Snapshot> {
        let mut snapshot = self.cache.get(&self.account, true).await?;

        let presets = match self.store.presets_list(&self.account).await {
            Ok(presets) => presets,
            Err(e) if e.is_retryable() && snapshot.stale => {
                // Offline: nothing to resolve against; keep the last view.
                snapshot.lock = self.state.lock().await.clone();
                return Ok(snapshot);
            }
            Err(e) => return Err(e),
        };

        let resolved = resolve_active_preset(&presets, now_local).map(|p| p.id);

        // A preset ended early by tapout stays ended for the rest of its
        // occurrence. Once the schedule stops matching it (or a different
        // preset takes over), the marker is cleared and the preset can
        // activate again on its next occurrence.
        let active = {
            let mut tapped_out = self.tapped_out.lock().await;
            match (*tapped_out, resolved) {
                (Some(ended), Some(id)) if ended == id => None,
                _ => {
                    *tapped_out = None;
                    resolved
                }
            }
        };

        let mut state = self.state.lock().await;
        let next = match (&*state, active) {
            (LockState::Unlocked, Some(id)) => Some(LockState::LockedScheduled { preset_id: id }),
            (LockState::LockedScheduled { .. }, None) => Some(LockState::Unlocked),
            (LockState::LockedScheduled { preset_id }, Some(id)) if *preset_id != id => {
                Some(LockState::LockedScheduled { preset_id: id })
            }
            _ => None,
        };

        if let Some(next) = next {
            info!(account = %self.account, from = ?*state, to = ?next, "schedule transition");
            self.store.lock_set(&self.account, &next).await?;
            *state = next;
        }

        snapshot.lock = state.clone();
        snapshot.active_preset = active;
        drop(state);

        self.cache.put_local(&self.account, snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Create or update a preset. Rejected while locked; overlapping
    /// one-shot windows are rejected at this edit surface so schedule
    /// resolution can assume at most one matches.
    pub async fn preset_save(&self, preset: Preset) -> Result<()> {
        self.guard_mutation().await?;

        let existing = self.store.presets_list(&self.account).await?;
        check_window_overlap(&existing, &preset)?;

        self.store.preset_put(&self.account, preset).await
    }

    pub async fn preset_remove(&self, id: Uuid) -> Result<()> {
        self.guard_mutation().await?;
        self.store.preset_delete(&self.account, id).await
    }

    async fn refresh_cached_lock(&self, lock: LockState) {
        if let Ok(mut snapshot) = self.cache.get(&self.account, false).await {
            snapshot.lock = lock;
            snapshot.fetched_at = Utc::now();
            self.cache.put_local(&self.account, snapshot).await;
        }
    }
}
