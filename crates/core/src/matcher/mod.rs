//! Ring discovery: per-market rounds, candidate evaluation and the
//! block-driven scheduler that runs them.

mod evaluator;
mod market;
mod scheduler;

pub use evaluator::{EvaluationContext, Evaluator};
pub use market::Market;
pub use scheduler::RoundScheduler;

use crate::collaborators::{Balances, OrderPool};
use crate::config::MinerConfig;
use crate::matched_state::MatchedStateCache;
use crate::settlement::RingSubmitter;
use std::sync::Arc;

/// Shared services a market worker needs during a round
#[derive(Clone)]
pub struct MinerContext {
    pub config: Arc<MinerConfig>,
    pub order_pool: Arc<dyn OrderPool>,
    pub balances: Arc<dyn Balances>,
    pub evaluator: Arc<Evaluator>,
    pub submitter: Arc<RingSubmitter>,
    pub cache: Arc<MatchedStateCache>,
}
