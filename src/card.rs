//! Card registry: whitelist checks and the account <-> card binding.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::error::{LockError, Result};
use crate::ids::{CardId, Email};
use crate::store::{CardBinding, RemoteStore};

/// Outcome of an administrative whitelist insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistOutcome {
    Added,
    /// Duplicate insertion is idempotent, not an error.
    AlreadyListed,
}

pub struct CardRegistry {
    store: Arc<dyn RemoteStore>,
    /// The single identity allowed to modify the whitelist.
    operator: Email,
}

impl CardRegistry {
    pub fn new(store: Arc<dyn RemoteStore>, operator: Email) -> Self {
        Self { store, operator }
    }

    pub async fn is_whitelisted(&self, raw_card: &str) -> Result<bool> {
        let card = CardId::parse(raw_card)?;
        self.store.whitelist_contains(&card).await
    }

    /// Add a card to the whitelist. Restricted to the operator identity.
    pub async fn whitelist_add(&self, actor: &Email, raw_card: &str) -> Result<WhitelistOutcome> {
        if *actor != self.operator {
            return Err(LockError::validation(format!(
                "only the operator may modify the whitelist (got {actor})"
            )));
        }

        let card = CardId::parse(raw_card)?;
        if self.store.whitelist_insert(&card, actor).await? {
            info!(%card, "card whitelisted");
            Ok(WhitelistOutcome::Added)
        } else {
            Ok(WhitelistOutcome::AlreadyListed)
        }
    }

    /// Bind a card to an account.
    ///
    /// `NotFound` if the card is not whitelisted; `Conflict` if it is
    /// bound to a different account. Re-registering the account's own
    /// card is an upsert that re-stamps the registration timestamp. The
    /// bind is a conditional update at the store, retried once on a lost
    /// race.
    pub async fn register_card(&self, account: &Email, raw_card: &str) -> Result<CardBinding> {
        let card = CardId::parse(raw_card)?;

        if !self.store.whitelist_contains(&card).await? {
            return Err(LockError::not_found(format!("card {card} (not whitelisted)")));
        }

        let binding = CardBinding {
            card: card.clone(),
            settings: json!({}),
            registered_at: Utc::now(),
        };

        for _ in 0..2 {
            if self
                .store
                .bind_card_if_free(account, binding.clone())
                .await?
            {
                info!(account = %account, %card, "card registered");
                return Ok(binding);
            }
        }

        Err(LockError::conflict(format!(
            "card {card} is registered to another account"
        )))
    }

    /// Clear the account's binding, including the preset-assignment
    /// references carried in its settings blob. The whitelist entry is
    /// never removed.
    pub async fn unregister_card(&self, account: &Email) -> Result<()> {
        self.store.binding_clear(account).await?;
        info!(account = %account, "card unregistered");
        Ok(())
    }
}
