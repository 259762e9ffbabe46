//! One-time code dispatch to the transactional-email collaborator.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::ids::Email;

/// Dispatches one-time codes. Fire-and-forget from the account service's
/// point of view: a failed send rolls nothing back.
#[async_trait]
pub trait CodeMailer: Send + Sync {
    async fn send_code(&self, to: &Email, code: &str) -> Result<()>;
}

/// Development mailer that logs the code instead of sending it.
pub struct LogMailer;

#[async_trait]
impl CodeMailer for LogMailer {
    async fn send_code(&self, to: &Email, code: &str) -> Result<()> {
        info!(to = %to, code, "one-time code (log mailer)");
        Ok(())
    }
}
