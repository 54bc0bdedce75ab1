use crate::collaborators::PriceRef;
use crate::config::MinerConfig;
use crate::domain::{FeeSelection, Ring, RingSubmitInfo};
use crate::math::{cv_square, fraction_from_f64, nth_root, u256_to_rat, RATE_RATIO_SCALE};
use crate::{Error, Result};
use ethers::types::Address;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use std::sync::Arc;
use tracing::debug;

/// Resources shared by every order of one ring evaluation.
///
/// Owned by the caller and never shared across concurrent evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    /// Fee-token balance the fee receiver can still spend on margin-split rebates
    pub fee_receiver_fee_balance: BigRational,
}

impl EvaluationContext {
    pub fn new(fee_receiver_fee_balance: BigRational) -> Self {
        Self {
            fee_receiver_fee_balance,
        }
    }
}

/// Prices candidate rings: reduced rate, fills, fees, fairness and net value
pub struct Evaluator {
    fee_token: Address,
    native_token: Address,
    cvs_threshold: BigInt,
    real_cost_rate: BigRational,
    wallet_split: BigRational,
    default_margin_split: BigRational,
    price_ref: Arc<dyn PriceRef>,
}

impl Evaluator {
    pub fn new(config: &MinerConfig, price_ref: Arc<dyn PriceRef>) -> Result<Self> {
        Ok(Self {
            fee_token: config.fee_token,
            native_token: config.native_token,
            cvs_threshold: BigInt::from(config.rate_ratio_cvs_threshold),
            real_cost_rate: fraction_from_f64(config.real_cost_rate)?,
            wallet_split: fraction_from_f64(config.wallet_split)?,
            default_margin_split: BigRational::new(
                BigInt::from(config.default_margin_split_percentage),
                BigInt::from(100),
            ),
            price_ref,
        })
    }

    /// Computes prices, fills and fees of `ring` in place.
    ///
    /// `ctx` is debited for every margin-split rebate granted, in ring order.
    pub fn compute_ring(&self, ring: &mut Ring, ctx: &mut EvaluationContext) -> Result<()> {
        if ring.orders.len() < 2 {
            return Err(Error::InsufficientRingLength(ring.orders.len()));
        }
        if let Some(empty) = ring
            .orders
            .iter()
            .find(|o| o.order().amount_s.is_zero() || o.order().amount_b.is_zero())
        {
            return Err(Error::ZeroCapacity(empty.hash()));
        }
        if !ring.closure_holds() {
            return Err(Error::ClosureViolated);
        }

        self.compute_reduced_rate(ring)?;
        self.compute_fill_amounts(ring)?;
        self.compute_fees(ring, ctx)?;
        let cvs = self.check_fairness(ring)?;

        debug!(
            "Evaluated ring of {} orders: rate={} legal_fee={} cvs={}",
            ring.orders.len(),
            ring.reduced_rate,
            ring.legal_fee,
            cvs
        );
        Ok(())
    }

    /// Geometric-mean discount shared by every order
    fn compute_reduced_rate(&self, ring: &mut Ring) -> Result<()> {
        let mut product_s = BigRational::one();
        let mut product_b = BigRational::one();
        for filled in &ring.orders {
            product_s *= u256_to_rat(filled.order().amount_s);
            product_b *= u256_to_rat(filled.order().amount_b);
        }

        let root = nth_root(&(product_s / product_b), ring.orders.len())?;
        ring.reduced_rate = root.recip();
        Ok(())
    }

    fn compute_fill_amounts(&self, ring: &mut Ring) -> Result<()> {
        for filled in ring.orders.iter_mut() {
            filled.s_price = filled.order().sell_price() * &ring.reduced_rate;
            filled.b_price = filled.s_price.recip();

            if filled.order().buy_no_more_than_amount_b {
                filled.available_amount_s = &filled.available_amount_b * &filled.s_price;
            } else {
                filled.available_amount_b = &filled.available_amount_s * &filled.b_price;
            }

            if !filled.available_amount_s.is_positive() || !filled.available_amount_b.is_positive()
            {
                return Err(Error::ZeroCapacity(filled.hash()));
            }
        }

        // First pass: find the bottleneck
        let mut min_idx = 0;
        for i in 0..ring.orders.len() {
            let fill_s = if i == 0 {
                ring.orders[0].available_amount_s.clone()
            } else {
                let prev_fill_b = &ring.orders[i - 1].fill_amount_b;
                if *prev_fill_b >= ring.orders[i].available_amount_s {
                    min_idx = i;
                    ring.orders[i].available_amount_s.clone()
                } else {
                    prev_fill_b.clone()
                }
            };
            let filled = &mut ring.orders[i];
            filled.fill_amount_b = &fill_s * &filled.b_price;
            filled.fill_amount_s = fill_s;
        }

        // Re-propagate outward from it
        for i in (0..min_idx).rev() {
            let next_fill_s = ring.orders[i + 1].fill_amount_s.clone();
            let filled = &mut ring.orders[i];
            filled.fill_amount_s = &next_fill_s * &filled.s_price;
            filled.fill_amount_b = next_fill_s;
        }
        for i in (min_idx + 1)..ring.orders.len() {
            let prev_fill_b = ring.orders[i - 1].fill_amount_b.clone();
            let filled = &mut ring.orders[i];
            filled.fill_amount_b = &prev_fill_b * &filled.b_price;
            filled.fill_amount_s = prev_fill_b;
        }

        // Close the cycle on the smaller side of the wrap edge
        let last = ring.orders.len() - 1;
        let closing = if ring.orders[last].fill_amount_b < ring.orders[0].fill_amount_s {
            ring.orders[last].fill_amount_b.clone()
        } else {
            ring.orders[0].fill_amount_s.clone()
        };
        ring.orders[last].fill_amount_b = closing.clone();
        ring.orders[0].fill_amount_s = closing;

        Ok(())
    }

    fn compute_fees(&self, ring: &mut Ring, ctx: &mut EvaluationContext) -> Result<()> {
        ring.legal_fee = BigRational::zero();

        for filled in ring.orders.iter_mut() {
            let order = filled.order().clone();

            let (saving, saving_token) = if order.buy_no_more_than_amount_b {
                (
                    &filled.fill_amount_b * order.sell_price() - &filled.fill_amount_s,
                    order.token_s,
                )
            } else {
                (
                    &filled.fill_amount_b - &filled.fill_amount_s * order.buy_price(),
                    order.token_b,
                )
            };
            let legal_saving = self.price_ref.unit_value(saving_token, &saving)?;
            filled.fee_s = saving;

            // selling the fee token draws fill and fee from one balance
            let fee_balance = if order.token_s == self.fee_token {
                let left = &filled.available_fee_balance - &filled.fill_amount_s;
                if left.is_positive() {
                    left
                } else {
                    BigRational::zero()
                }
            } else {
                filled.available_fee_balance.clone()
            };
            let mut fee = u256_to_rat(order.fee_amount) * &filled.fill_amount_s
                / u256_to_rat(order.amount_s);
            if fee > fee_balance {
                fee = fee_balance;
            }
            let legal_fee = self.price_ref.unit_value(self.fee_token, &fee)?;

            let split = match order.margin_split_percentage {
                Some(pct) => BigRational::new(BigInt::from(pct), BigInt::from(100)),
                None => self.default_margin_split.clone(),
            };
            let legal_split_fee = legal_saving * split;

            let two = BigRational::from_integer(BigInt::from(2));
            if &legal_fee * &two < legal_split_fee && ctx.fee_receiver_fee_balance > fee {
                ctx.fee_receiver_fee_balance -= &fee;
                filled.fee_selection = FeeSelection::MarginSplit;
                filled.legal_fee_s = legal_split_fee - &legal_fee;
                filled.fee_reward = fee.clone();
            } else {
                filled.fee_selection = FeeSelection::Fee;
                filled.legal_fee_s = legal_fee.clone();
                filled.fee_reward = BigRational::zero();
            }

            filled.fee_amount = fee;
            filled.legal_fee = legal_fee;
            ring.legal_fee += &filled.legal_fee_s;
        }

        Ok(())
    }

    /// Rate-ratio fairness statistic of an already priced ring.
    ///
    /// Fails when any order's discounted sell amount exceeds its original or
    /// when the statistic exceeds the configured threshold.
    pub fn check_fairness(&self, ring: &Ring) -> Result<BigInt> {
        let scale = BigRational::from_integer(BigInt::from(RATE_RATIO_SCALE));
        let mut rate_ratios = Vec::with_capacity(ring.orders.len());
        for filled in &ring.orders {
            let amount_s = u256_to_rat(filled.order().amount_s);
            let discounted_s = u256_to_rat(filled.order().amount_b) * &filled.s_price;
            if discounted_s > amount_s {
                return Err(Error::DiscountExceedsOriginal(filled.hash()));
            }
            rate_ratios.push((discounted_s * &scale / amount_s).floor().to_integer());
        }

        let cvs = cv_square(&rate_ratios, RATE_RATIO_SCALE)?;
        if cvs > self.cvs_threshold {
            return Err(Error::FairnessThresholdExceeded {
                cvs,
                threshold: self.cvs_threshold.clone(),
            });
        }
        Ok(cvs)
    }

    /// Sets the gas cost and net `received` value of a prepared submission
    pub fn evaluate_received(&self, info: &mut RingSubmitInfo) -> Result<()> {
        let gas_cost = u256_to_rat(info.total_gas()) * u256_to_rat(info.gas_price);
        let legal_cost = self.price_ref.unit_value(self.native_token, &gas_cost)?;

        info.received =
            (&info.ring.legal_fee - &legal_cost * &self.real_cost_rate) * &self.wallet_split;
        info.legal_cost = legal_cost;
        Ok(())
    }
}
