//! Accounts, membership and the one-time-code flows around signup,
//! signin and password reset.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{LockError, Result};
use crate::ids::Email;
use crate::mailer::CodeMailer;
use crate::store::{AccountRecord, OneTimeCode, RemoteStore};

/// One-time codes expire after this many minutes.
pub const CODE_TTL_MINUTES: i64 = 10;

/// Minimum password length accepted at signup.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Trial window granted at signup.
pub const TRIAL_DAYS: i64 = 14;

/// Membership status. Payment flows are an external collaborator; the
/// core only consumes the locking predicate and the trial countdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum Membership {
    Trial { ends_at: DateTime<Utc> },
    Paid,
}

impl Membership {
    pub fn allows_lock(&self, now: DateTime<Utc>) -> bool {
        match self {
            Membership::Paid => true,
            Membership::Trial { ends_at } => now < *ends_at,
        }
    }

    /// Remaining trial time, clamped at zero. Display helper for the
    /// countdown tick.
    pub fn trial_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Membership::Paid => None,
            Membership::Trial { ends_at } => Some((*ends_at - now).max(Duration::zero())),
        }
    }
}

/// Argon2id password hashing. The hashing primitive is pinned here so the
/// stored hash format is uniform across the store implementations.
pub struct PasswordVault;

impl PasswordVault {
    pub fn hash(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| LockError::validation(format!("failed to hash password: {e}")))
    }

    pub fn verify(password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| LockError::validation(format!("invalid password hash: {e}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

pub struct AccountService {
    store: Arc<dyn RemoteStore>,
    mailer: Arc<dyn CodeMailer>,
}

impl AccountService {
    pub fn new(store: Arc<dyn RemoteStore>, mailer: Arc<dyn CodeMailer>) -> Self {
        Self { store, mailer }
    }

    /// Create an account with a trial membership and dispatch a signup
    /// code. `Conflict` if the account already exists.
    pub async fn signup(&self, raw_email: &str, password: &str) -> Result<Email> {
        let email = Email::parse(raw_email)?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(LockError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        if self.store.account_get(&email).await?.is_some() {
            return Err(LockError::conflict(format!("account {email} already exists")));
        }

        let now = Utc::now();
        self.store
            .account_insert(AccountRecord {
                email: email.clone(),
                password_hash: PasswordVault::hash(password)?,
                membership: Membership::Trial {
                    ends_at: now + Duration::days(TRIAL_DAYS),
                },
                created_at: now,
            })
            .await?;
        info!(account = %email, "account created");

        self.issue_code(&email).await?;
        Ok(email)
    }

    /// Issue a fresh one-time code (signin or password reset), superseding
    /// any pending one, and dispatch it.
    ///
    /// Dispatch is fire-and-forget: the stored code and account state
    /// survive a send failure, which is surfaced as `Delivery`.
    pub async fn issue_code(&self, email: &Email) -> Result<()> {
        let now = Utc::now();
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));

        self.store
            .code_put(OneTimeCode {
                email: email.clone(),
                code: code.clone(),
                issued_at: now,
                expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            })
            .await?;

        if let Err(e) = self.mailer.send_code(email, &code).await {
            warn!(account = %email, error = %e, "code stored but dispatch failed");
            return Err(LockError::Delivery(e.to_string()));
        }
        Ok(())
    }

    /// Verify and consume the pending code for this email.
    ///
    /// `NotFound` when no code is pending, `Expired` past the window
    /// (the stale code is discarded; a new one must be issued), and a
    /// validation error on a mismatch, leaving the code in place.
    pub async fn verify_code(&self, raw_email: &str, code: &str) -> Result<()> {
        let email = Email::parse(raw_email)?;
        let now = Utc::now();

        let pending = self
            .store
            .code_get(&email)
            .await?
            .ok_or_else(|| LockError::not_found(format!("one-time code for {email}")))?;

        if pending.is_expired(now) {
            self.store.code_delete(&email).await?;
            return Err(LockError::Expired("one-time code".into()));
        }
        if pending.code != code {
            return Err(LockError::validation("incorrect one-time code"));
        }

        self.store.code_delete(&email).await?;
        info!(account = %email, "one-time code verified");
        Ok(())
    }

    /// Password signin. Errors do not reveal whether the account exists
    /// beyond the taxonomy's `NotFound`.
    pub async fn signin(&self, raw_email: &str, password: &str) -> Result<AccountRecord> {
        let email = Email::parse(raw_email)?;
        let record = self
            .store
            .account_get(&email)
            .await?
            .ok_or_else(|| LockError::not_found(format!("account {email}")))?;

        if !PasswordVault::verify(password, &record.password_hash)? {
            return Err(LockError::validation("incorrect password"));
        }
        Ok(record)
    }

    /// Delete the account. The store cascades presets, binding and any
    /// pending code; the whitelist entry is preserved. Callers consult
    /// the lock controller's gatekeeper first.
    pub async fn delete_account(&self, email: &Email) -> Result<()> {
        self.store.account_delete(email).await?;
        info!(account = %email, "account deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FailMailer;

    #[async_trait]
    impl CodeMailer for FailMailer {
        async fn send_code(&self, _to: &Email, _code: &str) -> Result<()> {
            Err(LockError::unavailable("smtp down"))
        }
    }

    fn service(store: Arc<MemoryStore>) -> AccountService {
        AccountService::new(store, Arc::new(crate::mailer::LogMailer))
    }

    #[tokio::test]
    async fn signup_normalizes_email_and_starts_trial() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());

        let email = svc.signup("Alice@Example.COM", "hunter2hunter2").await.unwrap();
        assert_eq!(email.as_str(), "alice@example.com");

        let record = store.account_get(&email).await.unwrap().unwrap();
        assert!(matches!(record.membership, Membership::Trial { .. }));
        assert!(record.membership.allows_lock(Utc::now()));
    }

    #[tokio::test]
    async fn signup_rejects_short_password_and_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store);

        assert!(matches!(
            svc.signup("alice@example.com", "short").await.unwrap_err(),
            LockError::Validation(_)
        ));

        svc.signup("alice@example.com", "hunter2hunter2").await.unwrap();
        assert!(matches!(
            svc.signup("ALICE@example.com", "hunter2hunter2").await.unwrap_err(),
            LockError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn code_round_trip_is_single_use() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let email = svc.signup("alice@example.com", "hunter2hunter2").await.unwrap();

        let code = store.code_get(&email).await.unwrap().unwrap().code;
        svc.verify_code("alice@example.com", &code).await.unwrap();

        // Consumed: a second verification finds nothing.
        assert!(matches!(
            svc.verify_code("alice@example.com", &code).await.unwrap_err(),
            LockError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn wrong_code_leaves_pending_code_in_place() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let email = Email::parse("alice@example.com").unwrap();
        store.seed_account(&email).await;

        let now = Utc::now();
        store
            .code_put(OneTimeCode {
                email: email.clone(),
                code: "123456".into(),
                issued_at: now,
                expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.verify_code("alice@example.com", "654321").await.unwrap_err(),
            LockError::Validation(_)
        ));
        // Still pending; the user may retry with the right code.
        assert!(store.code_get(&email).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_code_is_rejected_and_discarded() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let email = Email::parse("alice@example.com").unwrap();
        store.seed_account(&email).await;

        let now = Utc::now();
        store
            .code_put(OneTimeCode {
                email: email.clone(),
                code: "123456".into(),
                issued_at: now - Duration::minutes(11),
                expires_at: now - Duration::minutes(1),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.verify_code("alice@example.com", "123456").await.unwrap_err(),
            LockError::Expired(_)
        ));
        assert!(store.code_get(&email).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reissuing_supersedes_pending_code() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let email = svc.signup("alice@example.com", "hunter2hunter2").await.unwrap();

        let first = store.code_get(&email).await.unwrap().unwrap();
        svc.issue_code(&email).await.unwrap();
        let second = store.code_get(&email).await.unwrap().unwrap();

        assert!(second.issued_at >= first.issued_at);
        // Verifying with the superseded code only works if the draw
        // happened to repeat; the stored row is the second one.
        assert_eq!(second.expires_at, second.issued_at + Duration::minutes(CODE_TTL_MINUTES));
    }

    #[tokio::test]
    async fn delivery_failure_keeps_code_and_account() {
        let store = Arc::new(MemoryStore::new());
        let svc = AccountService::new(store.clone(), Arc::new(FailMailer));

        let err = svc.signup("alice@example.com", "hunter2hunter2").await.unwrap_err();
        assert!(matches!(err, LockError::Delivery(_)));

        // Neither the account nor the code rolled back.
        let email = Email::parse("alice@example.com").unwrap();
        assert!(store.account_get(&email).await.unwrap().is_some());
        assert!(store.code_get(&email).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn signin_verifies_password() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store);
        svc.signup("alice@example.com", "hunter2hunter2").await.unwrap();

        assert!(svc.signin("Alice@example.com", "hunter2hunter2").await.is_ok());
        assert!(matches!(
            svc.signin("alice@example.com", "wrong-password").await.unwrap_err(),
            LockError::Validation(_)
        ));
        assert!(matches!(
            svc.signin("bob@example.com", "hunter2hunter2").await.unwrap_err(),
            LockError::NotFound(_)
        ));
    }

    #[test]
    fn trial_membership_expires() {
        let now = Utc::now();
        let active = Membership::Trial {
            ends_at: now + Duration::days(1),
        };
        let lapsed = Membership::Trial {
            ends_at: now - Duration::days(1),
        };

        assert!(active.allows_lock(now));
        assert!(!lapsed.allows_lock(now));
        assert!(Membership::Paid.allows_lock(now));
        assert_eq!(lapsed.trial_remaining(now), Some(Duration::zero()));
        assert_eq!(Membership::Paid.trial_remaining(now), None);
    }
}
