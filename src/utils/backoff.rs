//! Bounded, jittered exponential backoff sequence used between commit
//! resends and before restarting a failed transaction.

use crate::utils::{ErrCode, ShardTxError};

use rand::Rng;

use tokio::time::Duration;

/// Backoff delay generator. The first `nzeros` delays are zero; after that,
/// each delay is drawn uniformly from `[0, next]`, where `next` starts at
/// `next_us` and is multiplied by `factor` after every draw until it reaches
/// `max_us`.
#[derive(Debug, Clone)]
pub struct BackoffSeq {
    /// Remaining number of leading zero delays.
    nzeros: u8,

    /// Multiplication factor applied to the upper bound after each draw.
    factor: u32,

    /// Current upper bound of the next delay in microseconds.
    next_us: u64,

    /// Cap of the upper bound in microseconds.
    max_us: u64,
}

impl BackoffSeq {
    /// Creates a new backoff sequence.
    pub fn new(
        nzeros: u8,
        factor: u32,
        next_us: u64,
        max_us: u64,
    ) -> Result<Self, ShardTxError> {
        if factor == 0 || next_us > max_us {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!(
                    "invalid backoff params factor {} next {} max {}",
                    factor, next_us, max_us
                ),
            ));
        }
        Ok(BackoffSeq {
            nzeros,
            factor,
            next_us,
            max_us,
        })
    }

    /// Returns the next delay of the sequence.
    pub fn next_delay(&mut self) -> Duration {
        if self.nzeros > 0 {
            self.nzeros -= 1;
            return Duration::ZERO;
        }

        let bound = self.next_us;
        if self.next_us < self.max_us {
            self.next_us = self
                .next_us
                .saturating_mul(self.factor as u64)
                .min(self.max_us);
        }

        let delay = if bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=bound)
        };
        Duration::from_micros(delay)
    }

    /// Current upper bound of the next non-zero delay.
    #[inline]
    pub fn upper_bound(&self) -> Duration {
        Duration::from_micros(self.next_us)
    }
}

#[cfg(test)]
mod backoff_tests {
    use super::*;

    #[test]
    fn invalid_params() {
        assert!(BackoffSeq::new(0, 0, 10, 100).is_err());
        assert!(BackoffSeq::new(0, 2, 1000, 100).is_err());
    }

    #[test]
    fn leading_zeros() -> Result<(), ShardTxError> {
        let mut seq = BackoffSeq::new(2, 4, 1000, 4000)?;
        assert!(seq.next_delay().is_zero());
        assert!(seq.next_delay().is_zero());
        assert!(seq.next_delay() <= Duration::from_micros(1000));
        Ok(())
    }

    #[test]
    fn bounded_growth() -> Result<(), ShardTxError> {
        let mut seq = BackoffSeq::new(0, 4, 1000, 20_000)?;
        let bounds = [1000, 4000, 16_000, 20_000, 20_000];
        for bound in bounds {
            assert_eq!(seq.upper_bound(), Duration::from_micros(bound));
            assert!(seq.next_delay() <= Duration::from_micros(bound));
        }
        Ok(())
    }
}
