//! Typed messages passed between the round scheduler, the ring submitter
//! and the matched-state cache.
//!
//! Delivery is at-least-once; every handler is keyed by ring hash and
//! tolerates duplicates.

use crate::domain::{RingHash, RingSubmitInfo, TxHash};
use ethers::types::U256;

/// Rings committed by one scheduling round
#[derive(Debug, Clone)]
pub struct NewRingsEvent {
    pub block_number: u64,
    pub rings: Vec<RingSubmitInfo>,
}

/// Final word on a ring's submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Settlement mined
    Mined { tx_hash: TxHash, used_gas: U256 },
    /// Failed on-chain, or invalidated by a fork
    Failed { reason: String },
    /// Never left the process: persistence, gas estimation or broadcast failed
    NotSent { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSubmitResultEvent {
    pub ring_hash: RingHash,
    pub outcome: SubmitOutcome,
}

impl RingSubmitResultEvent {
    pub fn mined(ring_hash: RingHash, tx_hash: TxHash, used_gas: U256) -> Self {
        Self {
            ring_hash,
            outcome: SubmitOutcome::Mined { tx_hash, used_gas },
        }
    }

    pub fn failed(ring_hash: RingHash, reason: impl Into<String>) -> Self {
        Self {
            ring_hash,
            outcome: SubmitOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn not_sent(ring_hash: RingHash, reason: impl Into<String>) -> Self {
        Self {
            ring_hash,
            outcome: SubmitOutcome::NotSent {
                reason: reason.into(),
            },
        }
    }

    /// Whether this is the published ring-submission-failed event
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, SubmitOutcome::Failed { .. })
    }
}
