use crate::config::MinerConfig;
use crate::domain::{FilledOrder, Ring, RingHash};
use crate::math::{rat_to_u256, u256_to_rat};
use crate::Result;
use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

/// Settlement entry point of the protocol contract
pub const SUBMIT_RING_SIGNATURE: &str =
    "submitRing(address[2][],uint256[6][],uint8[1][],bool[],uint8[],bytes32[],bytes32[],address,address,uint16)";

/// Anti-front-running ring hash registration
pub const SUBMIT_RING_HASH_SIGNATURE: &str = "submitRinghash(address,bytes32)";

/// Typed call encoding for the contracts a ring settles through.
///
/// Chosen once at construction; nothing is resolved by method name at call time.
pub trait ProtocolContract: Send + Sync {
    /// Contract receiving the settlement call
    fn settlement_address(&self) -> Address;

    /// Contract receiving the ring hash registration
    fn registry_address(&self) -> Address;

    fn encode_submit_ring(&self, ring: &Ring, miner: Address, fee_receiver: Address)
        -> Result<Bytes>;

    fn encode_submit_ring_hash(&self, miner: Address, ring_hash: RingHash) -> Result<Bytes>;
}

/// ABI encoder for the ring protocol contracts
#[derive(Debug, Clone)]
pub struct RingProtocolAbi {
    protocol_address: Address,
    registry_address: Address,
    default_margin_split_percentage: u8,
}

impl RingProtocolAbi {
    pub fn new(config: &MinerConfig) -> Self {
        Self {
            protocol_address: config.protocol_address,
            registry_address: config.registry_address,
            default_margin_split_percentage: config.default_margin_split_percentage,
        }
    }

    fn order_uints(&self, filled: &FilledOrder, ring: &Ring) -> Result<Token> {
        let order = filled.order();
        let rate_amount_s = rat_to_u256(&(u256_to_rat(order.amount_s) * &ring.reduced_rate))?;
        Ok(Token::FixedArray(vec![
            Token::Uint(order.amount_s),
            Token::Uint(order.amount_b),
            Token::Uint(U256::from(order.valid_since)),
            Token::Uint(U256::from(order.valid_until)),
            Token::Uint(order.fee_amount),
            Token::Uint(rate_amount_s),
        ]))
    }
}

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

impl ProtocolContract for RingProtocolAbi {
    fn settlement_address(&self) -> Address {
        self.protocol_address
    }

    fn registry_address(&self) -> Address {
        self.registry_address
    }

    fn encode_submit_ring(
        &self,
        ring: &Ring,
        miner: Address,
        fee_receiver: Address,
    ) -> Result<Bytes> {
        let mut addresses = Vec::with_capacity(ring.orders.len());
        let mut uints = Vec::with_capacity(ring.orders.len());
        let mut margins = Vec::with_capacity(ring.orders.len());
        let mut buy_caps = Vec::with_capacity(ring.orders.len());
        let mut vs = Vec::with_capacity(ring.orders.len());
        let mut rs = Vec::with_capacity(ring.orders.len());
        let mut ss = Vec::with_capacity(ring.orders.len());

        for filled in &ring.orders {
            let order = filled.order();
            addresses.push(Token::FixedArray(vec![
                Token::Address(order.owner),
                Token::Address(order.token_s),
            ]));
            uints.push(self.order_uints(filled, ring)?);
            let margin = order
                .margin_split_percentage
                .unwrap_or(self.default_margin_split_percentage);
            margins.push(Token::FixedArray(vec![Token::Uint(U256::from(margin))]));
            buy_caps.push(Token::Bool(order.buy_no_more_than_amount_b));
            vs.push(Token::Uint(U256::from(order.v)));
            rs.push(Token::FixedBytes(order.r.as_bytes().to_vec()));
            ss.push(Token::FixedBytes(order.s.as_bytes().to_vec()));
        }

        Ok(with_selector(
            SUBMIT_RING_SIGNATURE,
            &[
                Token::Array(addresses),
                Token::Array(uints),
                Token::Array(margins),
                Token::Array(buy_caps),
                Token::Array(vs),
                Token::Array(rs),
                Token::Array(ss),
                Token::Address(miner),
                Token::Address(fee_receiver),
                Token::Uint(U256::from(ring.fee_selection_bits())),
            ],
        ))
    }

    fn encode_submit_ring_hash(&self, miner: Address, ring_hash: RingHash) -> Result<Bytes> {
        Ok(with_selector(
            SUBMIT_RING_HASH_SIGNATURE,
            &[
                Token::Address(miner),
                Token::FixedBytes(ring_hash.as_bytes().to_vec()),
            ],
        ))
    }
}
