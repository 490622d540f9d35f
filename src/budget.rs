//! Process-wide cap on reported entries (`--max-events`).

use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct EventBudget {
    remaining: AtomicU64,
    exhausted: CancellationToken,
}

impl EventBudget {
    pub fn new(limit: u64) -> Self {
        let budget = Self {
            remaining: AtomicU64::new(limit),
            exhausted: CancellationToken::new(),
        };
        if limit == 0 {
            budget.exhausted.cancel();
        }
        budget
    }

    /// Claims one entry. The claim that uses up the budget still succeeds and
    /// wakes [`EventBudget::exhausted`] waiters.
    pub fn try_take(&self) -> bool {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.exhausted.cancel();
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }

    /// Resolves once the last entry has been claimed.
    pub async fn exhausted(&self) {
        self.exhausted.cancelled().await
    }
}
