//! Identifier normalization, applied at every boundary.
//!
//! Card ids strip `:` separators and upper-case; emails lower-case. The
//! newtypes only ever hold the normalized form, so lookups and equality
//! never see raw user input.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LockError, Result};

/// Normalized physical-token identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// Normalize a raw card id: strip `:` separators, upper-case.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_uppercase();

        if normalized.is_empty() {
            return Err(LockError::validation("card id is empty"));
        }
        if normalized.chars().any(|c| c.is_whitespace()) {
            return Err(LockError::validation(format!(
                "card id contains whitespace: {raw:?}"
            )));
        }

        Ok(CardId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized (lower-cased) account email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();

        let (local, domain) = normalized
            .split_once('@')
            .ok_or_else(|| LockError::validation(format!("not an email address: {raw:?}")))?;
        if local.is_empty() || domain.is_empty() {
            return Err(LockError::validation(format!(
                "not an email address: {raw:?}"
            )));
        }

        Ok(Email(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_id_strips_separators_and_uppercases() {
        let a = CardId::parse("AA:BB:CC").unwrap();
        let b = CardId::parse("aabbcc").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AABBCC");
    }

    #[test]
    fn card_id_rejects_empty() {
        assert!(CardId::parse("").is_err());
        assert!(CardId::parse(":::").is_err());
        assert!(CardId::parse("  ").is_err());
    }

    #[test]
    fn card_id_rejects_inner_whitespace() {
        assert!(CardId::parse("AA BB").is_err());
    }

    #[test]
    fn email_lowercases() {
        let e = Email::parse("Alice@Example.COM").unwrap();
        assert_eq!(e.as_str(), "alice@example.com");
    }

    #[test]
    fn email_rejects_malformed() {
        assert!(Email::parse("not-an-email").is_err());
        assert!(Email::parse("@example.com").is_err());
        assert!(Email::parse("alice@").is_err());
    }
}
