use super::{Market, MinerContext};
use crate::events::NewRingsEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Block-driven round trigger running one worker per market
pub struct RoundScheduler {
    markets: Vec<Arc<Mutex<Market>>>,
    ctx: MinerContext,
    interval: u64,

    /// Held for the whole round; stores the block of the last round started
    round_lock: Mutex<Option<u64>>,

    rings_tx: mpsc::UnboundedSender<NewRingsEvent>,
}

impl RoundScheduler {
    pub fn new(ctx: MinerContext, rings_tx: mpsc::UnboundedSender<NewRingsEvent>) -> Self {
        let markets = ctx
            .config
            .markets
            .iter()
            .map(|pair| Arc::new(Mutex::new(Market::new(*pair))))
            .collect();
        let interval = ctx.config.round_interval_blocks.max(1);

        Self {
            markets,
            ctx,
            interval,
            round_lock: Mutex::new(None),
            rings_tx,
        }
    }

    pub fn markets(&self) -> &[Arc<Mutex<Market>>] {
        &self.markets
    }

    /// Runs a round if `block_number` is due and no round is in progress.
    /// Returns whether a round ran.
    pub async fn on_new_block(&self, block_number: u64) -> bool {
        let Ok(mut last_round) = self.round_lock.try_lock() else {
            debug!("Round still running, skipping block {}", block_number);
            return false;
        };

        if let Some(last) = *last_round {
            if block_number < last.saturating_add(self.interval) {
                debug!(
                    "Block {} within interval of last round at {}",
                    block_number, last
                );
                return false;
            }
        }

        *last_round = Some(block_number);
        self.run_round(block_number).await;
        true
    }

    /// Starts every market worker, waits for all of them, then publishes
    /// the committed rings as one batch
    async fn run_round(&self, block_number: u64) -> usize {
        let mut workers = JoinSet::new();
        for market in &self.markets {
            let market = Arc::clone(market);
            let ctx = self.ctx.clone();
            workers.spawn(async move { market.lock().await.run_round(&ctx, block_number).await });
        }

        let mut rings = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(committed) => rings.extend(committed),
                Err(e) => error!("Market worker failed at block {}: {}", block_number, e),
            }
        }

        let count = rings.len();
        info!(
            "Round at block {} finished: {} markets, {} rings",
            block_number,
            self.markets.len(),
            count
        );
        if self.rings_tx.send(NewRingsEvent { block_number, rings }).is_err() {
            error!("Ring batch channel closed, dropping round {}", block_number);
        }
        count
    }
}
