use super::{EvaluationContext, MinerContext};
use crate::domain::{
    closure_holds, Direction, FilledOrder, MarketPair, OrderHash, OrderState, Ring,
    RingSubmitInfo,
};
use crate::math::{rat_to_u256, u256_to_rat};
use crate::Result;
use ethers::types::{Address, U256};
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use rand::Rng;
use std::mem;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// One token pair and the orders flowing through it this round
#[derive(Debug)]
pub struct Market {
    pair: MarketPair,
    a_to_b: Vec<OrderState>,
    b_to_a: Vec<OrderState>,
    exclude_a_to_b: Vec<OrderHash>,
    exclude_b_to_a: Vec<OrderHash>,
}

/// Rounds tentative amounts up so committed capacity is never under-counted
fn ceil_u256(value: &BigRational) -> Result<U256> {
    rat_to_u256(&value.ceil())
}

impl Market {
    pub fn new(pair: MarketPair) -> Self {
        Self {
            pair,
            a_to_b: Vec::new(),
            b_to_a: Vec::new(),
            exclude_a_to_b: Vec::new(),
            exclude_b_to_a: Vec::new(),
        }
    }

    pub fn pair(&self) -> &MarketPair {
        &self.pair
    }

    /// Orders skipped by the next fetch in `direction`
    pub fn excluded(&self, direction: Direction) -> &[OrderHash] {
        match direction {
            Direction::AToB => &self.exclude_a_to_b,
            Direction::BToA => &self.exclude_b_to_a,
        }
    }

    fn exclude_mut(&mut self, direction: Direction) -> &mut Vec<OrderHash> {
        match direction {
            Direction::AToB => &mut self.exclude_a_to_b,
            Direction::BToA => &mut self.exclude_b_to_a,
        }
    }

    fn pool_mut(&mut self, direction: Direction) -> &mut Vec<OrderState> {
        match direction {
            Direction::AToB => &mut self.a_to_b,
            Direction::BToA => &mut self.b_to_a,
        }
    }

    /// Fetches, pairs, ranks and commits. Returns the committed rings.
    pub async fn run_round(&mut self, ctx: &MinerContext, block_number: u64) -> Vec<RingSubmitInfo> {
        for direction in [Direction::AToB, Direction::BToA] {
            let states = self.fetch(ctx, direction).await;
            *self.pool_mut(direction) = states;
        }

        let candidates = self.pair_candidates(ctx, block_number).await;
        let candidate_count = candidates.len();
        let committed = self.commit_candidates(ctx, candidates, block_number).await;

        info!(
            "Market {} round at block {}: {}/{} orders, {} candidates, {} committed",
            self.pair,
            block_number,
            self.a_to_b.len(),
            self.b_to_a.len(),
            candidate_count,
            committed.len()
        );
        committed
    }

    async fn fetch(&mut self, ctx: &MinerContext, direction: Direction) -> Vec<OrderState> {
        let exclude = mem::take(self.exclude_mut(direction));
        let jitter = if ctx.config.max_fetch_delay > 0 {
            rand::thread_rng().gen_range(0..=ctx.config.max_fetch_delay) / 2
        } else {
            0
        };

        let fetched = match ctx
            .order_pool
            .fetch_eligible(
                &self.pair,
                direction,
                ctx.config.round_order_count,
                &exclude,
                jitter,
            )
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Market {} fetch {:?} failed: {}", self.pair, direction, e);
                *self.exclude_mut(direction) = exclude;
                return Vec::new();
            }
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut states = Vec::with_capacity(fetched.len());
        for mut state in fetched {
            let hash = state.hash();
            if let Err(reason) = state.order.validate() {
                debug!("Skipping invalid order {:?}: {}", hash, reason);
                continue;
            }
            if state.order.is_expired(now) {
                debug!("Skipping expired order {:?}", hash);
                continue;
            }
            if self.pair.direction_of(state.order.token_s, state.order.token_b) != Some(direction) {
                debug!("Skipping order {:?} outside market {}", hash, self.pair);
                continue;
            }

            let (pending_s, pending_b) = ctx.cache.dealt_amount(&hash);
            match (ceil_u256(&pending_s), ceil_u256(&pending_b)) {
                (Ok(s), Ok(b)) => {
                    state.dealt_amount_s = state.dealt_amount_s.saturating_add(s);
                    state.dealt_amount_b = state.dealt_amount_b.saturating_add(b);
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Skipping order {:?}: {}", hash, e);
                    continue;
                }
            }

            if ctx.order_pool.is_fully_consumed(&state) {
                debug!("Order {:?} fully consumed by pending rings", hash);
                self.exclude_mut(direction).push(hash);
                continue;
            }
            states.push(state);
        }
        states
    }

    async fn pair_candidates(&self, ctx: &MinerContext, block_number: u64) -> Vec<RingSubmitInfo> {
        let mut candidates = Vec::new();
        for a in &self.a_to_b {
            for b in &self.b_to_a {
                if !closure_holds(&[&a.order, &b.order]) {
                    debug!("Pair {:?}/{:?} fails closure", a.hash(), b.hash());
                    continue;
                }

                match generate_candidate(ctx, vec![a.clone(), b.clone()], block_number).await {
                    Ok(info) if info.received.is_positive() => candidates.push(info),
                    Ok(info) => debug!(
                        "Ring {:?} not profitable, received {}",
                        info.ring_hash(),
                        info.received
                    ),
                    Err(e) => debug!(
                        "Pair {:?}/{:?} rejected ({:?}): {}",
                        a.hash(),
                        b.hash(),
                        e.rejection(),
                        e
                    ),
                }
            }
        }
        candidates
    }

    /// Current in-round snapshot of an order, if still usable
    fn current_state(&self, hash: &OrderHash) -> Option<OrderState> {
        self.a_to_b
            .iter()
            .chain(self.b_to_a.iter())
            .find(|s| &s.hash() == hash)
            .cloned()
    }

    async fn commit_candidates(
        &mut self,
        ctx: &MinerContext,
        mut candidates: Vec<RingSubmitInfo>,
        block_number: u64,
    ) -> Vec<RingSubmitInfo> {
        candidates.sort_by(|a, b| b.received.cmp(&a.received));

        let mut committed = Vec::new();
        for candidate in candidates {
            let hashes = candidate.ring.order_hashes();
            let states: Option<Vec<OrderState>> =
                hashes.iter().map(|h| self.current_state(h)).collect();
            let Some(states) = states else {
                debug!(
                    "Ring {:?} dropped: an order was consumed earlier this round",
                    candidate.ring_hash()
                );
                continue;
            };

            let info = match generate_candidate(ctx, states, block_number).await {
                Ok(info) if info.received.is_positive() => info,
                Ok(info) => {
                    debug!("Ring {:?} no longer profitable", info.ring_hash());
                    continue;
                }
                Err(e) => {
                    debug!("Ring {:?} failed re-evaluation: {}", candidate.ring_hash(), e);
                    continue;
                }
            };

            if let Err(e) = self.apply_fills(ctx, &info) {
                warn!("Ring {:?} not committed: {}", info.ring_hash(), e);
                continue;
            }
            ctx.cache.commit(&info.ring);
            debug!("Committed ring {:?}, received {}", info.ring_hash(), info.received);
            committed.push(info);
        }
        committed
    }

    /// Adds a ring's fills to the in-round states; consumed orders leave the
    /// round and are excluded from the next fetch
    fn apply_fills(&mut self, ctx: &MinerContext, info: &RingSubmitInfo) -> Result<()> {
        let mut updates = Vec::with_capacity(info.ring.orders.len());
        for filled in &info.ring.orders {
            updates.push((
                filled.hash(),
                ceil_u256(&filled.fill_amount_s)?,
                ceil_u256(&filled.fill_amount_b)?,
            ));
        }

        for (hash, fill_s, fill_b) in updates {
            for direction in [Direction::AToB, Direction::BToA] {
                let pool = self.pool_mut(direction);
                let Some(idx) = pool.iter().position(|s| s.hash() == hash) else {
                    continue;
                };
                let state = &mut pool[idx];
                state.dealt_amount_s = state.dealt_amount_s.saturating_add(fill_s);
                state.dealt_amount_b = state.dealt_amount_b.saturating_add(fill_b);

                if ctx.order_pool.is_fully_consumed(state) {
                    pool.remove(idx);
                    self.exclude_mut(direction).push(hash);
                }
            }
        }
        Ok(())
    }
}

/// Spendable amount of `token` held by `owner`, net of pending ring exposure
async fn spendable(ctx: &MinerContext, owner: Address, token: Address) -> Result<BigRational> {
    let (balance, allowance) = ctx.balances.available(owner, token).await?;
    let available = u256_to_rat(balance.min(allowance)) - ctx.cache.filled_amount_s(owner, token);
    if available.is_negative() {
        return Ok(BigRational::zero());
    }
    Ok(available)
}

/// Builds, prices and prepares one candidate ring from order snapshots
async fn generate_candidate(
    ctx: &MinerContext,
    states: Vec<OrderState>,
    block_number: u64,
) -> Result<RingSubmitInfo> {
    let fee_token = ctx.config.fee_token;
    let mut filled = Vec::with_capacity(states.len());
    for state in states {
        let owner = state.order.owner;
        let token_s_balance = spendable(ctx, owner, state.order.token_s).await?;
        let fee_balance = spendable(ctx, owner, fee_token).await?;
        filled.push(FilledOrder::new(state, token_s_balance, fee_balance));
    }

    let receiver_balance = spendable(ctx, ctx.config.fee_receiver, fee_token).await?;
    let mut eval_ctx = EvaluationContext::new(receiver_balance);

    let mut ring = Ring::new(filled);
    ctx.evaluator.compute_ring(&mut ring, &mut eval_ctx)?;

    let mut info = ctx.submitter.prepare(ring, block_number).await?;
    ctx.evaluator.evaluate_received(&mut info)?;
    Ok(info)
}
