#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use miner_core::collaborators::{Balances, Ledger, OrderPool, PriceRef, Storage};
use miner_core::domain::{
    Direction, FilledOrder, MarketPair, Order, OrderHash, OrderState, RingHash, RingSubmitInfo,
    SubmitPhase, SubmitStatus, TxHash,
};
use miner_core::settlement::RingProtocolAbi;
use miner_core::{Collaborators, Error, Miner, MinerConfig, Result};
use num_rational::BigRational;
use num_traits::{One, Zero};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Barrier, Notify};

pub const X: u64 = 1;
pub const Y: u64 = 2;
pub const Z: u64 = 3;
pub const FEE_TOKEN: u64 = 50;
pub const NATIVE: u64 = 51;
pub const MINER: u64 = 90;
pub const FEE_RECEIVER: u64 = 91;
pub const PROTOCOL: u64 = 92;
pub const REGISTRY: u64 = 93;

pub fn addr(v: u64) -> Address {
    Address::from_low_u64_be(v)
}

/// Order paying `fee` directly (no margin split)
pub fn order(owner: u64, token_s: u64, token_b: u64, amount_s: u64, amount_b: u64, fee: u64) -> OrderState {
    let mut order = Order {
        hash: H256::zero(),
        protocol: addr(PROTOCOL),
        owner: addr(owner),
        token_s: addr(token_s),
        token_b: addr(token_b),
        amount_s: U256::from(amount_s),
        amount_b: U256::from(amount_b),
        valid_since: 0,
        valid_until: u64::MAX,
        fee_amount: U256::from(fee),
        buy_no_more_than_amount_b: false,
        margin_split_percentage: Some(0),
        v: 27,
        r: H256::from_low_u64_be(owner),
        s: H256::from_low_u64_be(owner),
    };
    order.hash = order.compute_hash();
    OrderState::new(order)
}

pub fn config() -> MinerConfig {
    MinerConfig {
        miner: addr(MINER),
        fee_receiver: addr(FEE_RECEIVER),
        fee_token: addr(FEE_TOKEN),
        native_token: addr(NATIVE),
        protocol_address: addr(PROTOCOL),
        registry_address: addr(REGISTRY),
        markets: vec![MarketPair::new(addr(X), addr(Y))],
        max_fetch_delay: 0,
        wallet_split: 0.5,
        ..MinerConfig::default()
    }
}

#[derive(Default)]
pub struct FakeOrderPool {
    orders: Mutex<Vec<OrderState>>,
    pub fetches: AtomicUsize,
    excludes: Mutex<Vec<Vec<OrderHash>>>,
    barrier: Mutex<Option<Arc<Barrier>>>,
    pause: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeOrderPool {
    pub fn add(&self, state: OrderState) {
        self.orders.lock().unwrap().push(state);
    }

    pub fn clear(&self) {
        self.orders.lock().unwrap().clear();
    }

    /// Every fetch waits until `parties` fetches are in flight at once
    pub fn gate_with_barrier(&self, parties: usize) {
        *self.barrier.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    /// The next fetch signals `started`, then waits for `release`
    pub fn pause_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.pause.lock().unwrap() = Some((started.clone(), release.clone()));
        (started, release)
    }

    /// Exclude list passed to every fetch so far, in call order
    pub fn excludes(&self) -> Vec<Vec<OrderHash>> {
        self.excludes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderPool for FakeOrderPool {
    async fn fetch_eligible(
        &self,
        market: &MarketPair,
        direction: Direction,
        limit: usize,
        exclude: &[OrderHash],
        _jitter: u64,
    ) -> Result<Vec<OrderState>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.excludes.lock().unwrap().push(exclude.to_vec());

        let barrier = self.barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let pause = self.pause.lock().unwrap().take();
        if let Some((started, release)) = pause {
            started.notify_one();
            release.notified().await;
        }

        let orders = self.orders.lock().unwrap();
        Ok(orders
            .iter()
            .filter(|s| market.direction_of(s.order.token_s, s.order.token_b) == Some(direction))
            .filter(|s| !exclude.contains(&s.hash()))
            .take(limit)
            .cloned()
            .collect())
    }

    fn is_fully_consumed(&self, state: &OrderState) -> bool {
        state.remained_amount().0 < BigRational::one()
    }
}

#[derive(Default)]
pub struct FakeBalances {
    overrides: Mutex<HashMap<(Address, Address), U256>>,
}

impl FakeBalances {
    pub fn set(&self, owner: u64, token: u64, amount: u64) {
        self.overrides
            .lock()
            .unwrap()
            .insert((addr(owner), addr(token)), U256::from(amount));
    }
}

#[async_trait]
impl Balances for FakeBalances {
    async fn available(&self, owner: Address, token: Address) -> Result<(U256, U256)> {
        let amount = self
            .overrides
            .lock()
            .unwrap()
            .get(&(owner, token))
            .copied()
            .unwrap_or_else(|| U256::exp10(12));
        Ok((amount, amount))
    }
}

/// Every token worth one unit, except the native token which is free
pub struct FlatPriceRef;

impl PriceRef for FlatPriceRef {
    fn unit_value(&self, token: Address, amount: &BigRational) -> Result<BigRational> {
        if token == addr(NATIVE) {
            return Ok(BigRational::zero());
        }
        Ok(amount.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub to: Address,
    pub gas: U256,
    pub tx_hash: TxHash,
}

#[derive(Default)]
pub struct FakeLedger {
    pub estimates: AtomicUsize,
    pub fail_broadcast: AtomicBool,
    next_hash: AtomicU64,
    broadcasts: Mutex<Vec<Broadcast>>,
}

impl FakeLedger {
    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn estimate_gas(&self, _data: &Bytes, _to: Address) -> Result<(U256, U256)> {
        self.estimates.fetch_add(1, Ordering::SeqCst);
        Ok((U256::from(250_000), U256::from(20)))
    }

    async fn broadcast(
        &self,
        _from: Address,
        to: Address,
        gas: U256,
        _gas_price: U256,
        _data: Bytes,
    ) -> Result<TxHash> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(Error::Ledger("nonce too low".to_string()));
        }
        let tx_hash = H256::from_low_u64_be(1000 + self.next_hash.fetch_add(1, Ordering::SeqCst));
        self.broadcasts.lock().unwrap().push(Broadcast { to, gas, tx_hash });
        Ok(tx_hash)
    }
}

#[derive(Default)]
pub struct InMemoryStorage {
    submissions: Mutex<HashMap<RingHash, RingSubmitInfo>>,
    audit_rows: AtomicUsize,
    tx_index: Mutex<HashMap<TxHash, Vec<RingHash>>>,
    reasons: Mutex<HashMap<RingHash, String>>,
    pub fail_record: AtomicBool,
}

impl InMemoryStorage {
    pub fn submissions(&self) -> Vec<RingSubmitInfo> {
        self.submissions.lock().unwrap().values().cloned().collect()
    }

    pub fn status(&self, ring_hash: &RingHash) -> Option<SubmitStatus> {
        self.submissions.lock().unwrap().get(ring_hash).map(|i| i.status)
    }

    pub fn reason(&self, ring_hash: &RingHash) -> Option<String> {
        self.reasons.lock().unwrap().get(ring_hash).cloned()
    }

    pub fn audit_rows(&self) -> usize {
        self.audit_rows.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_ring_submission(&self, info: &RingSubmitInfo, orders: &[FilledOrder]) -> Result<()> {
        self.audit_rows.fetch_add(orders.len(), Ordering::SeqCst);
        self.submissions
            .lock()
            .unwrap()
            .insert(info.ring_hash(), info.clone());
        Ok(())
    }

    async fn record_tx_hash(&self, ring_hash: RingHash, tx_hash: TxHash, phase: SubmitPhase) -> Result<()> {
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(Error::Storage("tx record unavailable".into()));
        }
        let mut submissions = self.submissions.lock().unwrap();
        let info = submissions
            .get_mut(&ring_hash)
            .ok_or_else(|| Error::Storage(format!("no submission {ring_hash:?}")))?;
        match phase {
            SubmitPhase::Registration => {
                info.registration_tx_hash = Some(tx_hash);
                info.status = SubmitStatus::RegistrationPending;
            }
            SubmitPhase::Settlement => {
                info.settlement_tx_hash = Some(tx_hash);
                info.status = SubmitStatus::SettlementPending;
            }
        }
        self.tx_index
            .lock()
            .unwrap()
            .entry(tx_hash)
            .or_default()
            .push(ring_hash);
        Ok(())
    }

    async fn mark_failed(&self, ring_hashes: &[RingHash], reason: &str) -> Result<()> {
        let mut submissions = self.submissions.lock().unwrap();
        for ring_hash in ring_hashes {
            if let Some(info) = submissions.get_mut(ring_hash) {
                info.status = SubmitStatus::Failed;
            }
            self.reasons
                .lock()
                .unwrap()
                .insert(*ring_hash, reason.to_string());
        }
        Ok(())
    }

    async fn mark_mined(&self, ring_hashes: &[RingHash], _tx_hash: TxHash, _used_gas: U256) -> Result<()> {
        let mut submissions = self.submissions.lock().unwrap();
        for ring_hash in ring_hashes {
            if let Some(info) = submissions.get_mut(ring_hash) {
                info.status = SubmitStatus::Mined;
            }
        }
        Ok(())
    }

    async fn tx_hash_to_ring_hashes(&self, tx_hash: TxHash) -> Result<Vec<RingHash>> {
        Ok(self
            .tx_index
            .lock()
            .unwrap()
            .get(&tx_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn roll_back(&self, from_block: u64, to_block: u64) -> Result<Vec<RingHash>> {
        let mut submissions = self.submissions.lock().unwrap();
        let mut rolled_back = Vec::new();
        for (ring_hash, info) in submissions.iter_mut() {
            if !info.is_final() && (from_block..=to_block).contains(&info.submitted_block) {
                info.status = SubmitStatus::Failed;
                rolled_back.push(*ring_hash);
            }
        }
        Ok(rolled_back)
    }

    async fn pending_submissions(&self) -> Result<Vec<RingSubmitInfo>> {
        Ok(self
            .submissions
            .lock()
            .unwrap()
            .values()
            .filter(|i| !i.is_final())
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub miner: Arc<Miner>,
    pub pool: Arc<FakeOrderPool>,
    pub balances: Arc<FakeBalances>,
    pub ledger: Arc<FakeLedger>,
    pub storage: Arc<InMemoryStorage>,
}

impl Harness {
    pub fn new(config: MinerConfig) -> Self {
        Self::with_storage(config, Arc::new(InMemoryStorage::default()))
    }

    pub fn with_storage(config: MinerConfig, storage: Arc<InMemoryStorage>) -> Self {
        let pool = Arc::new(FakeOrderPool::default());
        let balances = Arc::new(FakeBalances::default());
        let ledger = Arc::new(FakeLedger::default());
        let collaborators = Collaborators {
            order_pool: pool.clone(),
            balances: balances.clone(),
            price_ref: Arc::new(FlatPriceRef),
            ledger: ledger.clone(),
            storage: storage.clone(),
            protocol: Arc::new(RingProtocolAbi::new(&config)),
        };
        let miner = Arc::new(Miner::new(config, collaborators).unwrap());
        Self {
            miner,
            pool,
            balances,
            ledger,
            storage,
        }
    }

    /// Runs a round at `block` and submits what it committed
    pub async fn round(&self, block: u64) -> Vec<RingSubmitInfo> {
        assert!(self.miner.on_new_block(block).await, "round at {block} skipped");
        self.miner.drain().await;
        let mut rings: Vec<RingSubmitInfo> = self
            .storage
            .submissions()
            .into_iter()
            .filter(|i| i.submitted_block == block)
            .collect();
        rings.sort_by(|a, b| b.received.cmp(&a.received));
        rings
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
