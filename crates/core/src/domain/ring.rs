use super::orders::{Order, OrderHash, OrderState};
use crate::math::u256_to_rat;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use num_rational::BigRational;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

/// Ring identifier, the idempotency key for submission and bookkeeping
pub type RingHash = H256;

/// Ledger transaction hash
pub type TxHash = H256;

/// How an order settles its fee inside a ring
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FeeSelection {
    /// Pays its stated fee in the fee token
    #[default]
    Fee,
    /// Gives up a share of its price saving; the fee receiver funds the rebate
    MarginSplit,
}

/// An order's role inside one candidate ring.
///
/// Built fresh for every evaluation from an [`OrderState`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilledOrder {
    pub order_state: OrderState,

    /// Usable sell capacity for this evaluation
    pub available_amount_s: BigRational,

    /// Usable buy capacity for this evaluation
    pub available_amount_b: BigRational,

    /// Owner's spendable sell-token balance
    pub available_token_s_balance: BigRational,

    /// Owner's spendable fee-token balance
    pub available_fee_balance: BigRational,

    /// Sell price after the ring's reduced rate
    pub s_price: BigRational,

    /// Inverse of `s_price`
    pub b_price: BigRational,

    pub fill_amount_s: BigRational,
    pub fill_amount_b: BigRational,

    /// Price saving, in the token the order is not capped on
    pub fee_s: BigRational,

    /// Fee-token amount owed, scaled by the filled fraction
    pub fee_amount: BigRational,

    /// Unit-of-account value of `fee_amount`
    pub legal_fee: BigRational,

    /// Unit-of-account value this order contributes to the ring
    pub legal_fee_s: BigRational,

    /// Fee-token rebate the fee receiver pays out under margin split
    pub fee_reward: BigRational,

    pub fee_selection: FeeSelection,
}

/// Cyclic sequence of orders; each buy token is the next order's sell token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ring {
    pub hash: RingHash,
    pub orders: Vec<FilledOrder>,
    pub reduced_rate: BigRational,
    pub legal_fee: BigRational,
}

/// Where a ring submission stands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Persisted, nothing broadcast yet
    Pending,
    /// Ring hash registration broadcast, waiting for confirmation
    RegistrationPending,
    /// Settlement call broadcast, waiting for its receipt
    SettlementPending,
    /// Settlement mined successfully
    Mined,
    /// Terminal failure
    Failed,
}

/// Which of the two ledger calls a transaction belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubmitPhase {
    Registration,
    Settlement,
}

/// A selected ring plus everything needed to settle it on-ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RingSubmitInfo {
    pub ring: Ring,

    /// Settlement contract
    pub protocol_address: Address,

    /// Ring hash registry contract
    pub registry_address: Address,

    /// Account broadcasting the transactions
    pub miner: Address,

    /// Account collecting fees
    pub fee_receiver: Address,

    pub settlement_data: Bytes,
    pub settlement_gas: U256,
    pub gas_price: U256,

    /// Present only when pre-registration is enabled
    pub registration_data: Option<Bytes>,
    pub registration_gas: Option<U256>,

    /// Unit-of-account cost of the gas
    pub legal_cost: BigRational,

    /// Net value used for ranking
    pub received: BigRational,

    /// Block the submission round was triggered by
    pub submitted_block: u64,

    pub registration_tx_hash: Option<TxHash>,
    pub settlement_tx_hash: Option<TxHash>,
    pub status: SubmitStatus,
}

/// Ring-closure check: the product of sell amounts must cover the product of
/// buy amounts, otherwise no price can satisfy every order.
pub fn closure_holds(orders: &[&Order]) -> bool {
    let mut product_s = BigRational::one();
    let mut product_b = BigRational::one();
    for order in orders {
        product_s *= u256_to_rat(order.amount_s);
        product_b *= u256_to_rat(order.amount_b);
    }
    product_s >= product_b
}

impl FilledOrder {
    /// Builds the order's role from a snapshot and its owner's balances.
    ///
    /// Capacity is the remaining amount, capped by the spendable sell-token
    /// balance; the buy side shrinks along the original price.
    pub fn new(
        order_state: OrderState,
        token_s_balance: BigRational,
        fee_balance: BigRational,
    ) -> Self {
        let (mut available_amount_s, mut available_amount_b) = order_state.remained_amount();
        if available_amount_s > token_s_balance {
            available_amount_s = token_s_balance.clone();
            let by_balance = &available_amount_s / order_state.order.sell_price();
            if available_amount_b > by_balance {
                available_amount_b = by_balance;
            }
        }

        Self {
            order_state,
            available_amount_s,
            available_amount_b,
            available_token_s_balance: token_s_balance,
            available_fee_balance: fee_balance,
            s_price: BigRational::zero(),
            b_price: BigRational::zero(),
            fill_amount_s: BigRational::zero(),
            fill_amount_b: BigRational::zero(),
            fee_s: BigRational::zero(),
            fee_amount: BigRational::zero(),
            legal_fee: BigRational::zero(),
            legal_fee_s: BigRational::zero(),
            fee_reward: BigRational::zero(),
            fee_selection: FeeSelection::Fee,
        }
    }

    pub fn order(&self) -> &Order {
        &self.order_state.order
    }

    pub fn hash(&self) -> OrderHash {
        self.order_state.order.hash
    }
}

impl Ring {
    pub fn new(orders: Vec<FilledOrder>) -> Self {
        Self {
            hash: RingHash::zero(),
            orders,
            reduced_rate: BigRational::one(),
            legal_fee: BigRational::zero(),
        }
    }

    pub fn order_hashes(&self) -> Vec<OrderHash> {
        self.orders.iter().map(FilledOrder::hash).collect()
    }

    pub fn contains_order(&self, hash: &OrderHash) -> bool {
        self.orders.iter().any(|o| &o.hash() == hash)
    }

    /// True when each buy token feeds the next order's sell token
    pub fn is_cyclic(&self) -> bool {
        let n = self.orders.len();
        (0..n).all(|i| self.orders[i].order().token_b == self.orders[(i + 1) % n].order().token_s)
    }

    pub fn closure_holds(&self) -> bool {
        let orders: Vec<&Order> = self.orders.iter().map(FilledOrder::order).collect();
        closure_holds(&orders)
    }

    /// Bit `i` set when order `i` settles by margin split
    pub fn fee_selection_bits(&self) -> u16 {
        self.orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.fee_selection == FeeSelection::MarginSplit)
            .fold(0u16, |bits, (i, _)| bits | (1u16 << (i % 16)))
    }

    /// keccak256 over the XOR of member order hashes, the miner and the
    /// fee-selection bitmap
    pub fn compute_hash(&self, miner: Address) -> RingHash {
        let mut xor = [0u8; 32];
        for order in &self.orders {
            for (acc, byte) in xor.iter_mut().zip(order.hash().as_bytes()) {
                *acc ^= byte;
            }
        }
        let mut buf = Vec::with_capacity(32 + 20 + 2);
        buf.extend_from_slice(&xor);
        buf.extend_from_slice(miner.as_bytes());
        buf.extend_from_slice(&self.fee_selection_bits().to_be_bytes());
        H256::from(keccak256(buf))
    }
}

impl RingSubmitInfo {
    pub fn ring_hash(&self) -> RingHash {
        self.ring.hash
    }

    /// Gas for every call the submission needs
    pub fn total_gas(&self) -> U256 {
        self.settlement_gas
            .saturating_add(self.registration_gas.unwrap_or_default())
    }

    pub fn is_final(&self) -> bool {
        matches!(self.status, SubmitStatus::Mined | SubmitStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    fn order(id: u64, token_s: u64, token_b: u64, amount_s: u64, amount_b: u64) -> Order {
        let mut order = Order {
            hash: OrderHash::zero(),
            protocol: Address::zero(),
            owner: Address::from_low_u64_be(100 + id),
            token_s: Address::from_low_u64_be(token_s),
            token_b: Address::from_low_u64_be(token_b),
            amount_s: U256::from(amount_s),
            amount_b: U256::from(amount_b),
            valid_since: 0,
            valid_until: u64::MAX,
            fee_amount: U256::zero(),
            buy_no_more_than_amount_b: false,
            margin_split_percentage: None,
            v: 27,
            r: H256::from_low_u64_be(id),
            s: H256::zero(),
        };
        order.hash = order.compute_hash();
        order
    }

    fn rat(v: i64) -> BigRational {
        BigRational::from_i64(v).unwrap()
    }

    fn filled(order: Order, balance: i64) -> FilledOrder {
        FilledOrder::new(OrderState::new(order), rat(balance), rat(0))
    }

    #[test]
    fn closure_accepts_exact_match_and_rejects_loss() {
        let a = order(1, 1, 2, 1000, 100_000);
        let b = order(2, 2, 1, 100_000, 1000);
        assert!(closure_holds(&[&a, &b]));

        let a = order(1, 1, 2, 100, 1000);
        let b = order(2, 2, 1, 100, 1000);
        assert!(!closure_holds(&[&a, &b]));
    }

    #[test]
    fn filled_order_capped_by_balance() {
        let f = filled(order(1, 1, 2, 1000, 2000), 400);
        assert_eq!(f.available_amount_s, rat(400));
        assert_eq!(f.available_amount_b, rat(800));
    }

    #[test]
    fn filled_order_uses_remaining_when_balance_suffices() {
        let f = filled(order(1, 1, 2, 1000, 2000), 5000);
        assert_eq!(f.available_amount_s, rat(1000));
        assert_eq!(f.available_amount_b, rat(2000));
    }

    #[test]
    fn ring_hash_depends_on_fee_selection_and_miner() {
        let mut ring = Ring::new(vec![
            filled(order(1, 1, 2, 1000, 2000), 5000),
            filled(order(2, 2, 1, 2000, 1000), 5000),
        ]);
        assert!(ring.is_cyclic());

        let miner = Address::from_low_u64_be(9);
        let base = ring.compute_hash(miner);
        assert_ne!(base, ring.compute_hash(Address::from_low_u64_be(10)));

        ring.orders[1].fee_selection = FeeSelection::MarginSplit;
        assert_eq!(ring.fee_selection_bits(), 0b10);
        assert_ne!(base, ring.compute_hash(miner));
    }

    #[test]
    fn ring_hash_ignores_rotation() {
        let a = filled(order(1, 1, 2, 1000, 2000), 5000);
        let b = filled(order(2, 2, 1, 2000, 1000), 5000);
        let miner = Address::from_low_u64_be(9);
        let forward = Ring::new(vec![a.clone(), b.clone()]).compute_hash(miner);
        let rotated = Ring::new(vec![b, a]).compute_hash(miner);
        assert_eq!(forward, rotated);
    }
}
