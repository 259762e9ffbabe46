//! Emergency tapout quota: a rationed counter with slow, drift-free
//! replenishment so it cannot be used as a routine bypass.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// Maximum number of banked tapouts.
pub const MAX_TAPOUTS: u32 = 3;

/// Days between refills of one unit.
pub const REFILL_DAYS: i64 = 14;

/// Per-account tapout quota.
///
/// Invariants: `remaining <= MAX_TAPOUTS`, and `next_refill_at` is `None`
/// iff `remaining == MAX_TAPOUTS`. Fields are private so every mutation
/// goes through the settling logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    remaining: u32,
    next_refill_at: Option<DateTime<Utc>>,
}

impl Quota {
    /// A full quota with no pending refill.
    pub fn full() -> Self {
        Self {
            remaining: MAX_TAPOUTS,
            next_refill_at: None,
        }
    }

    /// Build a quota from stored fields, rejecting invariant violations.
    pub fn from_parts(remaining: u32, next_refill_at: Option<DateTime<Utc>>) -> Result<Self> {
        if remaining > MAX_TAPOUTS {
            return Err(LockError::validation(format!(
                "quota remaining {remaining} exceeds maximum {MAX_TAPOUTS}"
            )));
        }
        if (remaining == MAX_TAPOUTS) != next_refill_at.is_none() {
            return Err(LockError::validation(
                "quota refill timestamp must be set exactly when below maximum",
            ));
        }
        Ok(Self {
            remaining,
            next_refill_at,
        })
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn next_refill_at(&self) -> Option<DateTime<Utc>> {
        self.next_refill_at
    }

    /// Apply any refills that have come due.
    ///
    /// Each missed period advances the threshold by 14 days from the
    /// previous threshold, not from `now`, so late evaluation does not
    /// drift. Idempotent: calling twice with the same `now` is a no-op
    /// the second time.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        while self.remaining < MAX_TAPOUTS {
            match self.next_refill_at {
                Some(due) if due <= now => {
                    self.remaining += 1;
                    self.next_refill_at = if self.remaining == MAX_TAPOUTS {
                        None
                    } else {
                        Some(due + Duration::days(REFILL_DAYS))
                    };
                }
                _ => break,
            }
        }
    }

    /// Consume one tapout. Settles due refills first.
    pub fn consume(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.settle(now);

        if self.remaining == 0 {
            return Err(LockError::QuotaExhausted);
        }

        self.remaining -= 1;
        if self.next_refill_at.is_none() {
            self.next_refill_at = Some(now + Duration::days(REFILL_DAYS));
        }
        Ok(())
    }

    /// Time until the next refill, clamped at zero. Display helper for
    /// the countdown tick; performs no I/O.
    pub fn refill_eta(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_refill_at
            .map(|at| (at - now).max(Duration::zero()))
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::full()
    }
}
