pub mod collaborators;
pub mod config;
pub mod domain;
pub mod events;
pub mod matched_state;
pub mod matcher;
pub mod math;
pub mod miner;
pub mod settlement;

pub use config::MinerConfig;
pub use domain::{FilledOrder, MarketPair, Order, OrderState, Ring, RingSubmitInfo};
pub use matched_state::MatchedStateCache;
pub use matcher::{EvaluationContext, Evaluator, Market, RoundScheduler};
pub use miner::{Collaborators, Miner};
pub use settlement::RingSubmitter;

use domain::{OrderHash, TxHash};
use ethers::types::Address;
use num_bigint::BigInt;

/// Core result type for miner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Insufficient ring length: {0} orders")]
    InsufficientRingLength(usize),

    #[error("Ring closure violated: product of sell amounts below product of buy amounts")]
    ClosureViolated,

    #[error("Order {0:?} has no usable capacity")]
    ZeroCapacity(OrderHash),

    #[error("Discounted sell amount exceeds original for order {0:?}")]
    DiscountExceedsOriginal(OrderHash),

    #[error("Rate ratio cvs {cvs} exceeds threshold {threshold}")]
    FairnessThresholdExceeded { cvs: BigInt, threshold: BigInt },

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("No price reference for token {0:?}")]
    PriceUnavailable(Address),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Order pool error: {0}")]
    OrderPool(String),

    #[error("Unknown transaction: {0:?}")]
    UnknownTransaction(TxHash),

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// What a failed candidate or submission means for its orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The pairing itself can never settle; drop it
    Structural,
    /// Not affordable right now; orders stay eligible next round
    Resource,
    /// Ledger call failed before anything went out
    Submission,
    /// Bookkeeping or configuration problem
    Internal,
}

impl Error {
    /// Classifies the error for logging and routing
    pub fn rejection(&self) -> Rejection {
        match self {
            Error::InsufficientRingLength(_)
            | Error::ClosureViolated
            | Error::ZeroCapacity(_)
            | Error::DiscountExceedsOriginal(_)
            | Error::FairnessThresholdExceeded { .. }
            | Error::Arithmetic(_) => Rejection::Structural,
            Error::InsufficientBalance(_) | Error::PriceUnavailable(_) => Rejection::Resource,
            Error::Ledger(_) | Error::Encoding(_) => Rejection::Submission,
            Error::Storage(_)
            | Error::OrderPool(_)
            | Error::UnknownTransaction(_)
            | Error::ConfigError(_) => Rejection::Internal,
        }
    }
}
