//! HTTPS client for the hosted store.
//!
//! Conditional operations (quota consume, card bind) are expressed as
//! preconditioned requests; the server answers 409 when the precondition
//! fails and the caller sees that as a lost compare-and-set, not an error.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LockError, Result};
use crate::ids::{CardId, Email};
use crate::preset::Preset;
use crate::quota::Quota;
use crate::session::LockState;

use super::{AccountRecord, CardBinding, OneTimeCode, RemoteStore, StatusRow};

pub struct HttpStore {
    client: Client,
    base: url::Url,
}

impl HttpStore {
    /// Create a client for the hosted store. The URL must be HTTPS.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = url::Url::parse(base_url)
            .map_err(|e| LockError::validation(format!("invalid store URL: {e}")))?;
        if base.scheme() != "https" {
            return Err(LockError::validation(format!(
                "store URL must use HTTPS (got: {})",
                base.scheme()
            )));
        }

        let client = Client::builder()
            .user_agent(format!("taplock/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .https_only(true)
            .build()
            .map_err(|e| LockError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut url = self.base.clone();
        // Base URLs always have a path, so this cannot fail for https.
        url.path_segments_mut()
            .expect("https base URL")
            .extend(segments);
        url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| LockError::unavailable(format!("store request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        Err(Self::map_status(status, detail))
    }

    fn map_status(status: StatusCode, detail: String) -> LockError {
        let detail = if detail.is_empty() {
            status.to_string()
        } else {
            detail
        };
        match status {
            StatusCode::BAD_REQUEST => LockError::Validation(detail),
            StatusCode::NOT_FOUND => LockError::NotFound(detail),
            StatusCode::CONFLICT => LockError::Conflict(detail),
            StatusCode::GONE => LockError::Expired(detail),
            StatusCode::LOCKED => LockError::Locked,
            _ => LockError::RemoteUnavailable(format!("store returned {status}: {detail}")),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let response = self.send(self.client.get(self.endpoint(segments))).await?;
        response
            .json()
            .await
            .map_err(|e| LockError::unavailable(format!("malformed store response: {e}")))
    }

    /// GET that treats 404 as `None`.
    async fn get_json_opt<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Option<T>> {
        match self.get_json(segments).await {
            Ok(value) => Ok(Some(value)),
            Err(LockError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Preconditioned write: 2xx means applied, 409 means the condition
    /// failed (lost compare-and-set).
    async fn send_conditional(&self, request: RequestBuilder) -> Result<bool> {
        match self.send(request).await {
            Ok(_) => Ok(true),
            Err(LockError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn account_get(&self, email: &Email) -> Result<Option<AccountRecord>> {
        self.get_json_opt(&["accounts", email.as_str()]).await
    }

    async fn account_insert(&self, record: AccountRecord) -> Result<()> {
        self.send(self.client.post(self.endpoint(&["accounts"])).json(&record))
            .await?;
        Ok(())
    }

    async fn account_delete(&self, email: &Email) -> Result<()> {
        self.send(self.client.delete(self.endpoint(&["accounts", email.as_str()])))
            .await?;
        Ok(())
    }

    async fn code_put(&self, code: OneTimeCode) -> Result<()> {
        self.send(
            self.client
                .put(self.endpoint(&["codes", code.email.as_str()]))
                .json(&code),
        )
        .await?;
        Ok(())
    }

    async fn code_get(&self, email: &Email) -> Result<Option<OneTimeCode>> {
        self.get_json_opt(&["codes", email.as_str()]).await
    }

    async fn code_delete(&self, email: &Email) -> Result<()> {
        self.send(self.client.delete(self.endpoint(&["codes", email.as_str()])))
            .await?;
        Ok(())
    }

    async fn whitelist_contains(&self, card: &CardId) -> Result<bool> {
        Ok(self
            .get_json_opt::<serde_json::Value>(&["whitelist", card.as_str()])
            .await?
            .is_some())
    }

    async fn whitelist_insert(&self, card: &CardId, added_by: &Email) -> Result<bool> {
        let response = self
            .send(
                self.client
                    .put(self.endpoint(&["whitelist", card.as_str()]))
                    .json(&json!({ "added_by": added_by })),
            )
            .await?;
        // 201 on first insert, 200 when the entry already existed.
        Ok(response.status() == StatusCode::CREATED)
    }

    async fn binding_get(&self, email: &Email) -> Result<Option<CardBinding>> {
        self.get_json_opt(&["accounts", email.as_str(), "binding"]).await
    }

    async fn bind_card_if_free(&self, email: &Email, binding: CardBinding) -> Result<bool> {
        self.send_conditional(
            self.client
                .post(self.endpoint(&["accounts", email.as_str(), "binding", "bind"]))
                .json(&binding),
        )
        .await
    }

    async fn binding_clear(&self, email: &Email) -> Result<()> {
        self.send(
            self.client
                .delete(self.endpoint(&["accounts", email.as_str(), "binding"])),
        )
        .await?;
        Ok(())
    }

    async fn quota_get(&self, email: &Email) -> Result<Quota> {
        self.get_json(&["accounts", email.as_str(), "quota"]).await
    }

    async fn quota_cas(&self, email: &Email, expected: &Quota, next: &Quota) -> Result<bool> {
        self.send_conditional(
            self.client
                .put(self.endpoint(&["accounts", email.as_str(), "quota"]))
                .json(&json!({ "expected": expected, "next": next })),
        )
        .await
    }

    async fn presets_list(&self, email: &Email) -> Result<Vec<Preset>> {
        self.get_json(&["accounts", email.as_str(), "presets"]).await
    }

    async fn preset_put(&self, email: &Email, preset: Preset) -> Result<()> {
        self.send(
            self.client
                .put(self.endpoint(&[
                    "accounts",
                    email.as_str(),
                    "presets",
                    &preset.id.to_string(),
                ]))
                .json(&preset),
        )
        .await?;
        Ok(())
    }

    async fn preset_delete(&self, email: &Email, id: Uuid) -> Result<()> {
        self.send(self.client.delete(self.endpoint(&[
            "accounts",
            email.as_str(),
            "presets",
            &id.to_string(),
        ])))
        .await?;
        Ok(())
    }

    async fn lock_set(&self, email: &Email, lock: &LockState) -> Result<()> {
        self.send(
            self.client
                .put(self.endpoint(&["accounts", email.as_str(), "lock"]))
                .json(lock),
        )
        .await?;
        Ok(())
    }

    async fn status_fetch(&self, email: &Email) -> Result<StatusRow> {
        self.get_json(&["accounts", email.as_str(), "status"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_store_rejects_plain_http() {
        assert!(HttpStore::new("http://store.example.com/v1").is_err());
    }

    #[test]
    fn http_store_accepts_https() {
        assert!(HttpStore::new("https://store.example.com/v1").is_ok());
    }

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert!(matches!(
            HttpStore::map_status(StatusCode::NOT_FOUND, String::new()),
            LockError::NotFound(_)
        ));
        assert!(matches!(
            HttpStore::map_status(StatusCode::CONFLICT, "card bound".into()),
            LockError::Conflict(_)
        ));
        assert!(matches!(
            HttpStore::map_status(StatusCode::GONE, "code".into()),
            LockError::Expired(_)
        ));
        assert!(matches!(
            HttpStore::map_status(StatusCode::LOCKED, String::new()),
            LockError::Locked
        ));
        assert!(HttpStore::map_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).is_retryable());
        assert!(HttpStore::map_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
    }

    #[test]
    fn endpoint_joins_segments() {
        let store = HttpStore::new("https://store.example.com/v1").unwrap();
        // `@` is a valid path character and stays unencoded; characters
        // outside the segment set are escaped.
        let url = store.endpoint(&["accounts", "alice@example.com", "quota"]);
        assert_eq!(
            url.as_str(),
            "https://store.example.com/v1/accounts/alice@example.com/quota"
        );

        let url = store.endpoint(&["whitelist", "AA BB"]);
        assert_eq!(url.as_str(), "https://store.example.com/v1/whitelist/AA%20BB");
    }
}
