//! Interfaces to the systems the miner core drives but does not own:
//! the order pool, balance lookups, price references, the ledger and
//! durable storage.

use crate::domain::{
    Direction, FilledOrder, MarketPair, OrderHash, OrderState, RingHash, RingSubmitInfo,
    SubmitPhase, TxHash,
};
use crate::Result;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use num_rational::BigRational;

/// Source of orders to match
#[async_trait]
pub trait OrderPool: Send + Sync {
    /// Up to `limit` matchable orders flowing in `direction`, skipping
    /// `exclude`. `jitter` shifts the pool's staleness window so rounds do
    /// not keep refetching the same set.
    async fn fetch_eligible(
        &self,
        market: &MarketPair,
        direction: Direction,
        limit: usize,
        exclude: &[OrderHash],
        jitter: u64,
    ) -> Result<Vec<OrderState>>;

    /// Whether what is left of the order is too small to trade
    fn is_fully_consumed(&self, state: &OrderState) -> bool;
}

/// Token balance lookups
#[async_trait]
pub trait Balances: Send + Sync {
    /// Returns `(balance, allowance)` of `owner` for `token`
    async fn available(&self, owner: Address, token: Address) -> Result<(U256, U256)>;
}

/// Converts token amounts into a common unit of account
pub trait PriceRef: Send + Sync {
    fn unit_value(&self, token: Address, amount: &BigRational) -> Result<BigRational>;
}

/// Ledger reads and writes
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns `(gas, gas_price)` for a call of `data` against `to`
    async fn estimate_gas(&self, data: &Bytes, to: Address) -> Result<(U256, U256)>;

    /// Signs and sends a transaction, returning its hash
    async fn broadcast(
        &self,
        from: Address,
        to: Address,
        gas: U256,
        gas_price: U256,
        data: Bytes,
    ) -> Result<TxHash>;
}

/// Durable record of ring submissions
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a submission and its audit rows. Always called before broadcast.
    async fn save_ring_submission(&self, info: &RingSubmitInfo, orders: &[FilledOrder])
        -> Result<()>;

    /// Records a transaction sent for a ring
    async fn record_tx_hash(
        &self,
        ring_hash: RingHash,
        tx_hash: TxHash,
        phase: SubmitPhase,
    ) -> Result<()>;

    async fn mark_failed(&self, ring_hashes: &[RingHash], reason: &str) -> Result<()>;

    async fn mark_mined(&self, ring_hashes: &[RingHash], tx_hash: TxHash, used_gas: U256)
        -> Result<()>;

    /// Rings a transaction was sent for
    async fn tx_hash_to_ring_hashes(&self, tx_hash: TxHash) -> Result<Vec<RingHash>>;

    /// Invalidates non-final submissions made in `[from_block, to_block]`
    /// and returns their ring hashes
    async fn roll_back(&self, from_block: u64, to_block: u64) -> Result<Vec<RingHash>>;

    /// Submissions that are neither mined nor failed
    async fn pending_submissions(&self) -> Result<Vec<RingSubmitInfo>>;
}
