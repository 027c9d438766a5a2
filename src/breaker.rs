//! Bounce-rate circuit breaker.
//!
//! Once the ledger's bounce rate exceeds the configured ceiling the breaker
//! stays open for this and every later run. Nothing here clears it; an
//! operator has to deal with the bounces out of band.

use crate::ledger::SendOutcome;
use serde::Serialize;

/// Fraction of outcomes that bounced. An empty ledger has a rate of 0.
pub fn bounce_rate(outcomes: &[SendOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let bounced = outcomes.iter().filter(|o| o.bounced).count();
    bounced as f64 / outcomes.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BreakerStatus {
    Closed { bounce_rate: f64 },
    Open { bounce_rate: f64 },
}

impl BreakerStatus {
    pub fn bounce_rate(&self) -> f64 {
        match self {
            BreakerStatus::Closed { bounce_rate } | BreakerStatus::Open { bounce_rate } => {
                *bounce_rate
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, BreakerStatus::Open { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BounceBreaker {
    max_bounce_rate: f64,
}

impl BounceBreaker {
    pub fn new(max_bounce_rate: f64) -> Self {
        Self { max_bounce_rate }
    }

    pub fn max_bounce_rate(&self) -> f64 {
        self.max_bounce_rate
    }

    pub fn check(&self, outcomes: &[SendOutcome]) -> BreakerStatus {
        let rate = bounce_rate(outcomes);
        if rate > self.max_bounce_rate {
            BreakerStatus::Open { bounce_rate: rate }
        } else {
            BreakerStatus::Closed { bounce_rate: rate }
        }
    }

    pub fn may_continue(&self, outcomes: &[SendOutcome]) -> bool {
        !self.check(outcomes).is_open()
    }
}
