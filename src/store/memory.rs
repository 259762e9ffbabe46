//! In-memory store: the test double and the backing for local mode.
//!
//! Gives the same compare-and-set semantics as the hosted store (all
//! tables live under one lock, so conditional operations are atomic) and
//! can simulate outages for the reconciliation-layer tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::account::Membership;
use crate::error::{LockError, Result};
use crate::ids::{CardId, Email};
use crate::preset::Preset;
use crate::quota::Quota;
use crate::session::LockState;

use super::{AccountRecord, CardBinding, OneTimeCode, RemoteStore, StatusRow};

#[derive(Default)]
struct Tables {
    accounts: HashMap<Email, AccountRecord>,
    codes: HashMap<Email, OneTimeCode>,
    whitelist: HashMap<CardId, Email>,
    bindings: HashMap<Email, CardBinding>,
    quotas: HashMap<Email, Quota>,
    presets: HashMap<Email, Vec<Preset>>,
    locks: HashMap<Email, LockState>,

    // outage simulation and instrumentation
    offline: bool,
    fail_next_status_fetch: bool,
    status_fetches: u64,
}

impl Tables {
    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(LockError::unavailable("store offline"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a paid account with defaults, for tests and local mode.
    pub async fn seed_account(&self, email: &Email) {
        let mut t = self.tables.lock().await;
        t.accounts.insert(
            email.clone(),
            AccountRecord {
                email: email.clone(),
                password_hash: String::new(),
                membership: Membership::Paid,
                created_at: Utc::now(),
            },
        );
        t.quotas.insert(email.clone(), Quota::full());
        t.locks.insert(email.clone(), LockState::Unlocked);
    }

    pub async fn set_quota(&self, email: &Email, quota: Quota) {
        self.tables.lock().await.quotas.insert(email.clone(), quota);
    }

    /// Make every operation fail with `RemoteUnavailable` until cleared.
    pub async fn set_offline(&self, offline: bool) {
        self.tables.lock().await.offline = offline;
    }

    /// Fail only the next status fetch (for bounded-retry tests).
    pub async fn fail_next_status_fetch(&self) {
        self.tables.lock().await.fail_next_status_fetch = true;
    }

    pub async fn status_fetch_count(&self) -> u64 {
        self.tables.lock().await.status_fetches
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn account_get(&self, email: &Email) -> Result<Option<AccountRecord>> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.accounts.get(email).cloned())
    }

    async fn account_insert(&self, record: AccountRecord) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        if t.accounts.contains_key(&record.email) {
            return Err(LockError::conflict(format!(
                "account {} already exists",
                record.email
            )));
        }
        t.quotas.insert(record.email.clone(), Quota::full());
        t.locks.insert(record.email.clone(), LockState::Unlocked);
        t.accounts.insert(record.email.clone(), record);
        Ok(())
    }

    async fn account_delete(&self, email: &Email) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        if t.accounts.remove(email).is_none() {
            return Err(LockError::not_found(format!("account {email}")));
        }
        // Cascade; the whitelist entry is explicitly preserved.
        t.bindings.remove(email);
        t.presets.remove(email);
        t.codes.remove(email);
        t.quotas.remove(email);
        t.locks.remove(email);
        Ok(())
    }

    async fn code_put(&self, code: OneTimeCode) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        // Supersedes any previous code for the email.
        t.codes.insert(code.email.clone(), code);
        Ok(())
    }

    async fn code_get(&self, email: &Email) -> Result<Option<OneTimeCode>> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.codes.get(email).cloned())
    }

    async fn code_delete(&self, email: &Email) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        t.codes.remove(email);
        Ok(())
    }

    async fn whitelist_contains(&self, card: &CardId) -> Result<bool> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.whitelist.contains_key(card))
    }

    async fn whitelist_insert(&self, card: &CardId, added_by: &Email) -> Result<bool> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        if t.whitelist.contains_key(card) {
            return Ok(false);
        }
        t.whitelist.insert(card.clone(), added_by.clone());
        Ok(true)
    }

    async fn binding_get(&self, email: &Email) -> Result<Option<CardBinding>> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.bindings.get(email).cloned())
    }

    async fn bind_card_if_free(&self, email: &Email, binding: CardBinding) -> Result<bool> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        let owned_elsewhere = t
            .bindings
            .iter()
            .any(|(owner, b)| b.card == binding.card && owner != email);
        if owned_elsewhere {
            return Ok(false);
        }
        t.bindings.insert(email.clone(), binding);
        Ok(true)
    }

    async fn binding_clear(&self, email: &Email) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        t.bindings.remove(email);
        Ok(())
    }

    async fn quota_get(&self, email: &Email) -> Result<Quota> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.quotas.get(email).cloned().unwrap_or_default())
    }

    async fn quota_cas(&self, email: &Email, expected: &Quota, next: &Quota) -> Result<bool> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        let current = t.quotas.entry(email.clone()).or_default();
        if current != expected {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }

    async fn presets_list(&self, email: &Email) -> Result<Vec<Preset>> {
        let t = self.tables.lock().await;
        t.check_online()?;
        Ok(t.presets.get(email).cloned().unwrap_or_default())
    }

    async fn preset_put(&self, email: &Email, preset: Preset) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        let list = t.presets.entry(email.clone()).or_default();
        match list.iter_mut().find(|p| p.id == preset.id) {
            Some(existing) => *existing = preset,
            None => list.push(preset),
        }
        Ok(())
    }

    async fn preset_delete(&self, email: &Email, id: Uuid) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        let list = t.presets.entry(email.clone()).or_default();
        let before = list.len();
        list.retain(|p| p.id != id);
        if list.len() == before {
            return Err(LockError::not_found(format!("preset {id}")));
        }
        Ok(())
    }

    async fn lock_set(&self, email: &Email, lock: &LockState) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        t.locks.insert(email.clone(), lock.clone());
        Ok(())
    }

    async fn status_fetch(&self, email: &Email) -> Result<StatusRow> {
        let mut t = self.tables.lock().await;
        t.check_online()?;
        t.status_fetches += 1;
        if t.fail_next_status_fetch {
            t.fail_next_status_fetch = false;
            return Err(LockError::unavailable("injected fetch failure"));
        }
        let membership = t
            .accounts
            .get(email)
            .map(|a| a.membership.clone())
            .ok_or_else(|| LockError::not_found(format!("account {email}")))?;
        Ok(StatusRow {
            lock: t.locks.get(email).cloned().unwrap_or(LockState::Unlocked),
            quota: t.quotas.get(email).cloned().unwrap_or_default(),
            membership,
        })
    }
}
