//! Authoritative remote store interface.
//!
//! The cache/reconciliation layer and the services talk to the store
//! through [`RemoteStore`]. Two implementations: an HTTPS client for the
//! hosted store and an in-memory store for tests and local mode.
//!
//! The quota and the card binding are the only state with a real
//! concurrency requirement, so both get compare-and-set operations here;
//! everything else is plain read/write.

mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::Membership;
use crate::error::Result;
use crate::ids::{CardId, Email};
use crate::preset::Preset;
use crate::quota::Quota;
use crate::session::LockState;

/// Account row, keyed by normalized email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email: Email,
    /// Argon2 password hash; hashing policy is the account service's concern.
    pub password_hash: String,
    pub membership: Membership,
    pub created_at: DateTime<Utc>,
}

/// Time-boxed one-time code; at most one active per email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub email: Email,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OneTimeCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-account card binding. Cleared (never deleting the whitelist entry)
/// on unregister or account deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardBinding {
    pub card: CardId,
    /// Free-form settings blob, including preset-assignment references.
    pub settings: serde_json::Value,
    pub registered_at: DateTime<Utc>,
}

/// Status row served by the store for one account; the raw material for a
/// cached snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRow {
    pub lock: LockState,
    pub quota: Quota,
    pub membership: Membership,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    // accounts
    async fn account_get(&self, email: &Email) -> Result<Option<AccountRecord>>;
    /// `Conflict` if the account already exists.
    async fn account_insert(&self, record: AccountRecord) -> Result<()>;
    /// Cascades: presets, card binding, pending code and the account row
    /// are removed; the whitelist entry is explicitly preserved.
    async fn account_delete(&self, email: &Email) -> Result<()>;

    // one-time codes
    /// Inserting supersedes any previous code for the email.
    async fn code_put(&self, code: OneTimeCode) -> Result<()>;
    async fn code_get(&self, email: &Email) -> Result<Option<OneTimeCode>>;
    async fn code_delete(&self, email: &Email) -> Result<()>;

    // whitelist
    async fn whitelist_contains(&self, card: &CardId) -> Result<bool>;
    /// Returns `false` when the card was already whitelisted (idempotent).
    async fn whitelist_insert(&self, card: &CardId, added_by: &Email) -> Result<bool>;

    // card bindings
    async fn binding_get(&self, email: &Email) -> Result<Option<CardBinding>>;
    /// Conditional bind: succeeds (upsert for this account) unless the card
    /// is currently bound to a different account, in which case `false`.
    async fn bind_card_if_free(&self, email: &Email, binding: CardBinding) -> Result<bool>;
    async fn binding_clear(&self, email: &Email) -> Result<()>;

    // quota
    async fn quota_get(&self, email: &Email) -> Result<Quota>;
    /// Compare-and-set: applies `next` only if the stored value still
    /// equals `expected`; returns whether the swap happened.
    async fn quota_cas(&self, email: &Email, expected: &Quota, next: &Quota) -> Result<bool>;

    // presets
    async fn presets_list(&self, email: &Email) -> Result<Vec<Preset>>;
    async fn preset_put(&self, email: &Email, preset: Preset) -> Result<()>;
    async fn preset_delete(&self, email: &Email, id: Uuid) -> Result<()>;

    // lock + status
    async fn lock_set(&self, email: &Email, lock: &LockState) -> Result<()>;
    async fn status_fetch(&self, email: &Email) -> Result<StatusRow>;
}
