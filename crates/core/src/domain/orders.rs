use crate::math::u256_to_rat;
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use num_rational::BigRational;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

/// Content hash identifying a signed order
pub type OrderHash = H256;

/// Signed off-chain order intent. Never mutated once signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    /// Content hash of the order fields
    pub hash: OrderHash,

    /// Protocol contract the order was signed for
    pub protocol: Address,

    /// Order creator address
    pub owner: Address,

    /// Token to sell
    pub token_s: Address,

    /// Token to buy
    pub token_b: Address,

    /// Amount of sell token
    pub amount_s: U256,

    /// Amount of buy token
    pub amount_b: U256,

    /// Start of the validity window (unix seconds)
    pub valid_since: u64,

    /// End of the validity window (unix seconds)
    pub valid_until: u64,

    /// Fee amount, denominated in the protocol fee token
    pub fee_amount: U256,

    /// When set, `amount_b` is a hard cap on what the order receives
    pub buy_no_more_than_amount_b: bool,

    /// Share of the price saving the order gives up when paying by margin split.
    /// `None` falls back to the miner's configured default.
    pub margin_split_percentage: Option<u8>,

    /// Signature
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

/// Lifecycle status as confirmed on the ledger
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    /// Nothing dealt yet
    Open,
    /// Some amount dealt on-chain
    PartiallyFilled,
    /// Cancelled by owner
    Cancelled,
    /// Fully dealt
    Finished,
}

/// Ledger-confirmed progress of an order, owned by the order pool.
///
/// The matcher only adds tentative amounts on top of a snapshot of this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderState {
    pub order: Order,
    pub dealt_amount_s: U256,
    pub dealt_amount_b: U256,
    pub cancelled_amount_s: U256,
    pub cancelled_amount_b: U256,
    pub status: OrderStatus,
}

impl Order {
    /// Computes the content hash over the signed fields
    pub fn compute_hash(&self) -> OrderHash {
        let mut buf = Vec::with_capacity(4 * 20 + 7 * 32 + 1);
        buf.extend_from_slice(self.protocol.as_bytes());
        buf.extend_from_slice(self.owner.as_bytes());
        buf.extend_from_slice(self.token_s.as_bytes());
        buf.extend_from_slice(self.token_b.as_bytes());
        for word in [
            self.amount_s,
            self.amount_b,
            U256::from(self.valid_since),
            U256::from(self.valid_until),
            self.fee_amount,
            U256::from(self.margin_split_percentage.unwrap_or(0)),
        ] {
            let mut bytes = [0u8; 32];
            word.to_big_endian(&mut bytes);
            buf.extend_from_slice(&bytes);
        }
        buf.push(u8::from(self.buy_no_more_than_amount_b));
        H256::from(keccak256(buf))
    }

    /// Validates order parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.amount_s.is_zero() {
            return Err("Sell amount must be greater than zero".to_string());
        }

        if self.amount_b.is_zero() {
            return Err("Buy amount must be greater than zero".to_string());
        }

        if self.token_s == self.token_b {
            return Err("Sell and buy tokens must be different".to_string());
        }

        if let Some(pct) = self.margin_split_percentage {
            if pct > 100 {
                return Err(format!("Margin split percentage {pct} exceeds 100"));
            }
        }

        if self.valid_until <= self.valid_since {
            return Err("Valid_until must be after valid_since".to_string());
        }

        Ok(())
    }

    /// Checks if order is outside its validity window
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.valid_until
    }

    /// Original sell price, amount_s / amount_b
    pub fn sell_price(&self) -> BigRational {
        u256_to_rat(self.amount_s) / u256_to_rat(self.amount_b)
    }

    /// Original buy price, amount_b / amount_s
    pub fn buy_price(&self) -> BigRational {
        u256_to_rat(self.amount_b) / u256_to_rat(self.amount_s)
    }
}

impl OrderState {
    /// Wraps a freshly signed order with nothing dealt
    pub fn new(order: Order) -> Self {
        Self {
            order,
            dealt_amount_s: U256::zero(),
            dealt_amount_b: U256::zero(),
            cancelled_amount_s: U256::zero(),
            cancelled_amount_b: U256::zero(),
            status: OrderStatus::Open,
        }
    }

    pub fn hash(&self) -> OrderHash {
        self.order.hash
    }

    /// Remaining (sell, buy) capacity after dealt and cancelled amounts.
    ///
    /// Orders capping their buy amount are measured on the buy side and the
    /// sell side is derived through the original price; the others the
    /// other way round. Never negative.
    pub fn remained_amount(&self) -> (BigRational, BigRational) {
        let order = &self.order;
        if order.buy_no_more_than_amount_b {
            let reduced = u256_to_rat(self.dealt_amount_b) + u256_to_rat(self.cancelled_amount_b);
            let mut remained_b = u256_to_rat(order.amount_b) - reduced;
            if remained_b < BigRational::zero() {
                remained_b = BigRational::zero();
            }
            let remained_s = &remained_b * order.sell_price();
            (remained_s, remained_b)
        } else {
            let reduced = u256_to_rat(self.dealt_amount_s) + u256_to_rat(self.cancelled_amount_s);
            let mut remained_s = u256_to_rat(order.amount_s) - reduced;
            if remained_s < BigRational::zero() {
                remained_s = BigRational::zero();
            }
            let remained_b = &remained_s * order.buy_price();
            (remained_s, remained_b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    fn create_test_order() -> Order {
        let mut order = Order {
            hash: OrderHash::zero(),
            protocol: Address::from_low_u64_be(0xbeef),
            owner: Address::from_low_u64_be(0xa11ce),
            token_s: Address::from_low_u64_be(1),
            token_b: Address::from_low_u64_be(2),
            amount_s: U256::from(1000),
            amount_b: U256::from(2000),
            valid_since: 1_600_000_000,
            valid_until: 1_700_000_000,
            fee_amount: U256::from(10),
            buy_no_more_than_amount_b: false,
            margin_split_percentage: None,
            v: 27,
            r: H256::zero(),
            s: H256::zero(),
        };
        order.hash = order.compute_hash();
        order
    }

    fn rat(v: i64) -> BigRational {
        BigRational::from_i64(v).unwrap()
    }

    #[test]
    fn test_order_validation_success() {
        let order = create_test_order();
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_order_validation_zero_sell_amount() {
        let mut order = create_test_order();
        order.amount_s = U256::zero();
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_order_validation_same_tokens() {
        let mut order = create_test_order();
        order.token_b = order.token_s;
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_order_validation_margin_split_over_hundred() {
        let mut order = create_test_order();
        order.margin_split_percentage = Some(101);
        let msg = order.validate().unwrap_err();
        assert!(msg.contains("101"));
    }

    #[test]
    fn test_is_expired() {
        let order = create_test_order();
        assert!(!order.is_expired(1_650_000_000));
        assert!(order.is_expired(1_700_000_000));
    }

    #[test]
    fn hash_changes_with_any_signed_field() {
        let order = create_test_order();
        let mut other = order.clone();
        other.amount_b = U256::from(2001);
        assert_ne!(order.compute_hash(), other.compute_hash());

        let mut capped = order.clone();
        capped.buy_no_more_than_amount_b = true;
        assert_ne!(order.compute_hash(), capped.compute_hash());

        assert_eq!(order.hash, order.compute_hash());
    }

    #[test]
    fn remained_amount_measures_sell_side_by_default() {
        let mut state = OrderState::new(create_test_order());
        state.dealt_amount_s = U256::from(400);
        state.cancelled_amount_s = U256::from(100);

        let (remained_s, remained_b) = state.remained_amount();
        assert_eq!(remained_s, rat(500));
        assert_eq!(remained_b, rat(1000));
    }

    #[test]
    fn remained_amount_measures_buy_side_when_capped() {
        let mut order = create_test_order();
        order.buy_no_more_than_amount_b = true;
        let mut state = OrderState::new(order);
        state.dealt_amount_b = U256::from(1500);

        let (remained_s, remained_b) = state.remained_amount();
        assert_eq!(remained_b, rat(500));
        assert_eq!(remained_s, rat(250));
    }

    #[test]
    fn remained_amount_never_negative() {
        let mut state = OrderState::new(create_test_order());
        state.dealt_amount_s = U256::from(5000);
        let (remained_s, remained_b) = state.remained_amount();
        assert!(remained_s.is_zero());
        assert!(remained_b.is_zero());
    }

    #[test]
    fn order_serde_roundtrip() {
        let order = create_test_order();
        let s = serde_json::to_string(&order).expect("serialize");
        let back: Order = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(back, order);
    }
}
