//! RPC reply deadline built on a pinned `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::{ErrCode, ShardTxError};

use tokio::time::{self, Duration, Instant, Sleep};

/// Deadline by which an RPC reply must arrive. Meant to be raced against the
/// exchange future in a `tokio::select!`. Must be created inside a tokio
/// runtime.
#[derive(Debug)]
pub struct Deadline {
    sleep: Pin<Box<Sleep>>,
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Arms a deadline `budget` from now. A zero budget is rejected since it
    /// would fail every RPC before it is sent.
    pub fn after(budget: Duration) -> Result<Self, ShardTxError> {
        if budget.is_zero() {
            return logged_err!(ErrCode::Inval; "zero rpc deadline");
        }
        let started = Instant::now();
        Ok(Deadline {
            sleep: Box::pin(time::sleep_until(started + budget)),
            started,
            budget,
        })
    }

    /// Full budget this deadline was armed with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.sleep.is_elapsed()
    }

    /// Resolves once the deadline passes.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await
    }
}
