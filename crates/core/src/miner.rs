use crate::collaborators::{Balances, Ledger, OrderPool, PriceRef, Storage};
use crate::config::MinerConfig;
use crate::domain::{RingHash, TxHash};
use crate::events::{NewRingsEvent, RingSubmitResultEvent};
use crate::matched_state::MatchedStateCache;
use crate::matcher::{Evaluator, MinerContext, RoundScheduler};
use crate::settlement::{ProtocolContract, RingSubmitter};
use crate::Result;
use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External systems the miner drives
#[derive(Clone)]
pub struct Collaborators {
    pub order_pool: Arc<dyn OrderPool>,
    pub balances: Arc<dyn Balances>,
    pub price_ref: Arc<dyn PriceRef>,
    pub ledger: Arc<dyn Ledger>,
    pub storage: Arc<dyn Storage>,
    pub protocol: Arc<dyn ProtocolContract>,
}

/// Entry point wiring the scheduler, submitter and matched-state cache.
///
/// Round batches and submission outcomes travel over channels; [`Miner::start`]
/// pumps them in the background and [`Miner::drain`] does the same inline.
pub struct Miner {
    scheduler: RoundScheduler,
    submitter: Arc<RingSubmitter>,
    cache: Arc<MatchedStateCache>,
    storage: Arc<dyn Storage>,
    rings_rx: Mutex<mpsc::UnboundedReceiver<NewRingsEvent>>,
    results_rx: Mutex<mpsc::UnboundedReceiver<RingSubmitResultEvent>>,
}

impl Miner {
    pub fn new(config: MinerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (rings_tx, rings_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(MatchedStateCache::new());
        let evaluator = Arc::new(Evaluator::new(&config, Arc::clone(&collaborators.price_ref))?);
        let submitter = Arc::new(RingSubmitter::new(
            &config,
            Arc::clone(&collaborators.protocol),
            Arc::clone(&collaborators.ledger),
            Arc::clone(&collaborators.storage),
            results_tx,
        ));

        let ctx = MinerContext {
            config: Arc::clone(&config),
            order_pool: collaborators.order_pool,
            balances: collaborators.balances,
            evaluator,
            submitter: Arc::clone(&submitter),
            cache: Arc::clone(&cache),
        };

        info!("Miner configured with {} markets", config.markets.len());
        Ok(Self {
            scheduler: RoundScheduler::new(ctx, rings_tx),
            submitter,
            cache,
            storage: collaborators.storage,
            rings_rx: Mutex::new(rings_rx),
            results_rx: Mutex::new(results_rx),
        })
    }

    pub fn cache(&self) -> &MatchedStateCache {
        &self.cache
    }

    pub fn submitter(&self) -> &RingSubmitter {
        &self.submitter
    }

    pub fn scheduler(&self) -> &RoundScheduler {
        &self.scheduler
    }

    /// Triggers a round when the block is due; returns whether one ran
    pub async fn on_new_block(&self, block_number: u64) -> bool {
        self.scheduler.on_new_block(block_number).await
    }

    pub async fn on_registration_confirmed(&self, ring_hash: RingHash) -> Result<()> {
        self.submitter.on_registration_confirmed(ring_hash).await
    }

    pub async fn on_registration_method_executed(
        &self,
        tx_hash: TxHash,
        used_gas: U256,
        err: Option<String>,
    ) -> Result<()> {
        self.submitter
            .on_registration_method_executed(tx_hash, used_gas, err)
            .await
    }

    pub async fn on_method_executed(
        &self,
        tx_hash: TxHash,
        used_gas: U256,
        err: Option<String>,
    ) -> Result<()> {
        self.submitter.on_method_executed(tx_hash, used_gas, err).await
    }

    pub async fn on_transaction_not_found(&self, tx_hash: TxHash) -> Result<()> {
        self.submitter.on_transaction_not_found(tx_hash).await
    }

    /// Rolls back submissions made in the forked range and releases their fills
    pub async fn on_fork_detected(&self, from_block: u64, to_block: u64) -> Result<Vec<RingHash>> {
        let rolled_back = self.storage.roll_back(from_block, to_block).await?;
        warn!(
            "Fork {}..={} invalidated {} rings",
            from_block,
            to_block,
            rolled_back.len()
        );

        for ring_hash in &rolled_back {
            self.cache.release(ring_hash);
        }
        self.submitter.invalidate(&rolled_back, "rolled back by fork");
        Ok(rolled_back)
    }

    /// Reloads in-flight submissions after a restart
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.storage.pending_submissions().await?;
        for info in &pending {
            self.cache.commit(&info.ring);
            self.submitter.restore(info);
        }
        info!("Recovered {} pending ring submissions", pending.len());
        Ok(pending.len())
    }

    /// Handles every queued batch and outcome without waiting for more.
    /// Returns how many messages were processed.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;

        loop {
            let batch = self.rings_rx.lock().await.try_recv();
            match batch {
                Ok(batch) => {
                    self.submitter.submit_batch(batch).await;
                    processed += 1;
                }
                Err(_) => break,
            }
        }

        let mut results = self.results_rx.lock().await;
        while let Ok(event) = results.try_recv() {
            self.cache.apply(&event);
            processed += 1;
        }
        processed
    }

    /// Spawns the loops forwarding round batches to the submitter and
    /// submission outcomes to the cache
    pub fn start(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let miner = Arc::clone(self);
        let submit_loop = tokio::spawn(async move {
            loop {
                let batch = miner.rings_rx.lock().await.recv().await;
                match batch {
                    Some(batch) => miner.submitter.submit_batch(batch).await,
                    None => break,
                }
            }
            error!("Ring batch channel closed");
        });

        let miner = Arc::clone(self);
        let release_loop = tokio::spawn(async move {
            loop {
                let event = miner.results_rx.lock().await.recv().await;
                match event {
                    Some(event) => {
                        miner.cache.apply(&event);
                    }
                    None => break,
                }
            }
            error!("Ring result channel closed");
        });

        (submit_loop, release_loop)
    }
}
