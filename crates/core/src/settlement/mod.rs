//! Turns committed rings into ledger transactions and reconciles the
//! asynchronous signals that come back for them.

mod ledger;
mod protocol;

pub use ledger::EthersLedger;
pub use protocol::{
    ProtocolContract, RingProtocolAbi, SUBMIT_RING_HASH_SIGNATURE, SUBMIT_RING_SIGNATURE,
};

use crate::collaborators::{Ledger, Storage};
use crate::config::MinerConfig;
use crate::domain::{Ring, RingHash, RingSubmitInfo, SubmitPhase, SubmitStatus, TxHash};
use crate::events::{NewRingsEvent, RingSubmitResultEvent};
use crate::{Error, Result};
use dashmap::DashMap;
use ethers::types::{Address, U256};
use num_rational::BigRational;
use num_traits::Zero;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Two-phase ring submission
pub struct RingSubmitter {
    miner: Address,
    fee_receiver: Address,
    pre_registration: bool,
    min_gas_limit: U256,
    max_gas_limit: U256,
    protocol: Arc<dyn ProtocolContract>,
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn Storage>,

    /// Transaction hash -> rings it was sent for
    tx_index: DashMap<TxHash, Vec<RingHash>>,

    /// Registered rings waiting for confirmation before settlement
    awaiting_registration: DashMap<RingHash, RingSubmitInfo>,

    results: mpsc::UnboundedSender<RingSubmitResultEvent>,
}

impl RingSubmitter {
    pub fn new(
        config: &MinerConfig,
        protocol: Arc<dyn ProtocolContract>,
        ledger: Arc<dyn Ledger>,
        storage: Arc<dyn Storage>,
        results: mpsc::UnboundedSender<RingSubmitResultEvent>,
    ) -> Self {
        Self {
            miner: config.miner,
            fee_receiver: config.fee_receiver,
            pre_registration: config.pre_registration,
            min_gas_limit: U256::from(config.min_gas_limit),
            max_gas_limit: U256::from(config.max_gas_limit),
            protocol,
            ledger,
            storage,
            tx_index: DashMap::new(),
            awaiting_registration: DashMap::new(),
            results,
        }
    }

    /// Applies the configured floor and ceiling (0 disables either)
    fn clamp_gas(&self, gas: U256) -> U256 {
        let mut gas = gas;
        if !self.min_gas_limit.is_zero() && gas < self.min_gas_limit {
            gas = self.min_gas_limit;
        }
        if !self.max_gas_limit.is_zero() && gas > self.max_gas_limit {
            gas = self.max_gas_limit;
        }
        gas
    }

    /// Hashes, encodes and gas-estimates an evaluated ring.
    ///
    /// `received` is left at zero for the evaluator to fill in.
    pub async fn prepare(&self, mut ring: Ring, block_number: u64) -> Result<RingSubmitInfo> {
        ring.hash = ring.compute_hash(self.miner);

        let settlement_data = self
            .protocol
            .encode_submit_ring(&ring, self.miner, self.fee_receiver)?;
        let (gas, gas_price) = self
            .ledger
            .estimate_gas(&settlement_data, self.protocol.settlement_address())
            .await?;

        let (registration_data, registration_gas) = if self.pre_registration {
            let data = self.protocol.encode_submit_ring_hash(self.miner, ring.hash)?;
            let (gas, _) = self
                .ledger
                .estimate_gas(&data, self.protocol.registry_address())
                .await?;
            (Some(data), Some(self.clamp_gas(gas)))
        } else {
            (None, None)
        };

        Ok(RingSubmitInfo {
            ring,
            protocol_address: self.protocol.settlement_address(),
            registry_address: self.protocol.registry_address(),
            miner: self.miner,
            fee_receiver: self.fee_receiver,
            settlement_data,
            settlement_gas: self.clamp_gas(gas),
            gas_price,
            registration_data,
            registration_gas,
            legal_cost: BigRational::zero(),
            received: BigRational::zero(),
            submitted_block: block_number,
            registration_tx_hash: None,
            settlement_tx_hash: None,
            status: SubmitStatus::Pending,
        })
    }

    /// Submits every ring of a round batch
    pub async fn submit_batch(&self, event: NewRingsEvent) {
        info!(
            "Submitting {} rings from block {}",
            event.rings.len(),
            event.block_number
        );
        for info in event.rings {
            let ring_hash = info.ring_hash();
            if let Err(e) = self.submit(info).await {
                warn!("Ring {:?} not sent: {}", ring_hash, e);
            }
        }
    }

    /// Persists then broadcasts the first transaction of a ring.
    ///
    /// A failure before anything is broadcast marks the record failed and
    /// emits a not-sent outcome so the ring's tentative fills are released.
    pub async fn submit(&self, info: RingSubmitInfo) -> Result<()> {
        let ring_hash = info.ring_hash();

        if let Err(e) = self.storage.save_ring_submission(&info, &info.ring.orders).await {
            self.emit(RingSubmitResultEvent::not_sent(ring_hash, e.to_string()));
            return Err(e);
        }

        let sent = if info.registration_data.is_some() {
            self.send_registration(info).await
        } else {
            self.send_settlement(info).await.map(|_| ())
        };

        if let Err(e) = sent {
            self.abandon(ring_hash, &e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_registration(&self, mut info: RingSubmitInfo) -> Result<()> {
        let ring_hash = info.ring_hash();
        let data = info
            .registration_data
            .clone()
            .ok_or_else(|| Error::Encoding("ring hash registration not encoded".to_string()))?;
        let gas = info.registration_gas.unwrap_or(info.settlement_gas);

        let tx_hash = self
            .ledger
            .broadcast(self.miner, info.registry_address, gas, info.gas_price, data)
            .await?;
        self.track(tx_hash, ring_hash, SubmitPhase::Registration).await;

        info.registration_tx_hash = Some(tx_hash);
        info.status = SubmitStatus::RegistrationPending;
        self.awaiting_registration.insert(ring_hash, info);

        debug!("Ring {:?} registration sent in {:?}", ring_hash, tx_hash);
        Ok(())
    }

    async fn send_settlement(&self, mut info: RingSubmitInfo) -> Result<TxHash> {
        let ring_hash = info.ring_hash();
        let tx_hash = self
            .ledger
            .broadcast(
                self.miner,
                info.protocol_address,
                info.settlement_gas,
                info.gas_price,
                info.settlement_data.clone(),
            )
            .await?;
        self.track(tx_hash, ring_hash, SubmitPhase::Settlement).await;
        if let Some(registration_tx) = info.registration_tx_hash {
            self.untrack(registration_tx, ring_hash);
        }

        info.settlement_tx_hash = Some(tx_hash);
        info.status = SubmitStatus::SettlementPending;

        info!("Ring {:?} settlement sent in {:?}", ring_hash, tx_hash);
        Ok(tx_hash)
    }

    /// Indexes a broadcast transaction. The transaction is live from here on,
    /// so a storage error is logged and the ring stays in flight.
    async fn track(&self, tx_hash: TxHash, ring_hash: RingHash, phase: SubmitPhase) {
        {
            let mut rings = self.tx_index.entry(tx_hash).or_default();
            if !rings.contains(&ring_hash) {
                rings.push(ring_hash);
            }
        }
        if let Err(e) = self.storage.record_tx_hash(ring_hash, tx_hash, phase).await {
            error!(
                "Failed to record {:?} tx {:?} for ring {:?}: {}",
                phase, tx_hash, ring_hash, e
            );
        }
    }

    fn untrack(&self, tx_hash: TxHash, ring_hash: RingHash) {
        self.tx_index.remove_if_mut(&tx_hash, |_, rings| {
            rings.retain(|r| *r != ring_hash);
            rings.is_empty()
        });
    }

    /// Ring hashes a transaction was sent for, consuming the index entry
    async fn resolve(&self, tx_hash: TxHash) -> Result<Vec<RingHash>> {
        if let Some((_, rings)) = self.tx_index.remove(&tx_hash) {
            return Ok(rings);
        }
        let rings = self.storage.tx_hash_to_ring_hashes(tx_hash).await?;
        if rings.is_empty() {
            return Err(Error::UnknownTransaction(tx_hash));
        }
        Ok(rings)
    }

    async fn abandon(&self, ring_hash: RingHash, cause: &Error) {
        let reason = cause.to_string();
        warn!("Abandoning ring {:?}: {}", ring_hash, reason);
        if let Err(e) = self.storage.mark_failed(&[ring_hash], &reason).await {
            error!("Failed to mark ring {:?} failed: {}", ring_hash, e);
        }
        self.emit(RingSubmitResultEvent::not_sent(ring_hash, reason));
    }

    /// Marks rings permanently failed and publishes the failure
    async fn fail(&self, ring_hashes: &[RingHash], reason: &str) -> Result<()> {
        for ring_hash in ring_hashes {
            self.awaiting_registration.remove(ring_hash);
        }
        let marked = self.storage.mark_failed(ring_hashes, reason).await;
        for ring_hash in ring_hashes {
            warn!("Ring {:?} failed: {}", ring_hash, reason);
            self.emit(RingSubmitResultEvent::failed(*ring_hash, reason));
        }
        marked
    }

    fn emit(&self, event: RingSubmitResultEvent) {
        if self.results.send(event).is_err() {
            error!("Ring result channel closed");
        }
    }

    /// Registration confirmed: send the settlement call. Repeated signals
    /// for the same ring are ignored.
    pub async fn on_registration_confirmed(&self, ring_hash: RingHash) -> Result<()> {
        let Some((_, info)) = self.awaiting_registration.remove(&ring_hash) else {
            debug!("Ring {:?} not awaiting registration", ring_hash);
            return Ok(());
        };

        if let Err(e) = self.send_settlement(info).await {
            self.abandon(ring_hash, &e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Registration transaction executed; an error retires its rings
    pub async fn on_registration_method_executed(
        &self,
        tx_hash: TxHash,
        used_gas: U256,
        err: Option<String>,
    ) -> Result<()> {
        match err {
            Some(reason) => {
                let rings = self.resolve(tx_hash).await?;
                self.fail(&rings, &format!("registration rejected: {reason}")).await
            }
            None => {
                debug!("Registration {:?} executed, gas {}", tx_hash, used_gas);
                self.tx_index.remove(&tx_hash);
                Ok(())
            }
        }
    }

    /// Settlement transaction executed: mined on success, failed otherwise
    pub async fn on_method_executed(
        &self,
        tx_hash: TxHash,
        used_gas: U256,
        err: Option<String>,
    ) -> Result<()> {
        let rings = self.resolve(tx_hash).await?;
        match err {
            Some(reason) => self.fail(&rings, &format!("settlement reverted: {reason}")).await,
            None => {
                self.storage.mark_mined(&rings, tx_hash, used_gas).await?;
                for ring_hash in &rings {
                    info!("Ring {:?} mined in {:?}, gas {}", ring_hash, tx_hash, used_gas);
                    self.emit(RingSubmitResultEvent::mined(*ring_hash, tx_hash, used_gas));
                }
                Ok(())
            }
        }
    }

    /// The ledger dropped a transaction; its rings are retired
    pub async fn on_transaction_not_found(&self, tx_hash: TxHash) -> Result<()> {
        let rings = self.resolve(tx_hash).await?;
        self.fail(&rings, "transaction not found").await
    }

    /// Rebuilds in-memory tracking for a submission reloaded from storage
    pub fn restore(&self, info: &RingSubmitInfo) {
        let ring_hash = info.ring_hash();
        let registration_tx = match info.status {
            SubmitStatus::RegistrationPending => info.registration_tx_hash,
            _ => None,
        };
        for tx_hash in [registration_tx, info.settlement_tx_hash]
            .into_iter()
            .flatten()
        {
            let mut rings = self.tx_index.entry(tx_hash).or_default();
            if !rings.contains(&ring_hash) {
                rings.push(ring_hash);
            }
        }
        if info.status == SubmitStatus::RegistrationPending {
            self.awaiting_registration.insert(ring_hash, info.clone());
        }
    }

    /// Drops all tracking of rings invalidated by a fork and publishes their failure
    pub fn invalidate(&self, ring_hashes: &[RingHash], reason: &str) {
        for ring_hash in ring_hashes {
            self.awaiting_registration.remove(ring_hash);
            self.emit(RingSubmitResultEvent::failed(*ring_hash, reason));
        }
        self.tx_index.retain(|_, rings| {
            rings.retain(|r| !ring_hashes.contains(r));
            !rings.is_empty()
        });
    }

    pub fn is_awaiting_registration(&self, ring_hash: &RingHash) -> bool {
        self.awaiting_registration.contains_key(ring_hash)
    }

    pub fn tracked_transactions(&self) -> usize {
        self.tx_index.len()
    }
}
