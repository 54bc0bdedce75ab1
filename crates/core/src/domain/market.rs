use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unordered token pair a market matches on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MarketPair {
    pub token_a: Address,
    pub token_b: Address,
}

/// Flow direction inside a market
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Orders selling token A for token B
    AToB,
    /// Orders selling token B for token A
    BToA,
}

impl MarketPair {
    pub fn new(token_a: Address, token_b: Address) -> Self {
        Self { token_a, token_b }
    }

    /// Token sold by orders flowing in `direction`
    pub fn sell_token(&self, direction: Direction) -> Address {
        match direction {
            Direction::AToB => self.token_a,
            Direction::BToA => self.token_b,
        }
    }

    /// Token bought by orders flowing in `direction`
    pub fn buy_token(&self, direction: Direction) -> Address {
        self.sell_token(direction.opposite())
    }

    /// Direction an order selling `token_s` for `token_b` flows in, if it belongs here
    pub fn direction_of(&self, token_s: Address, token_b: Address) -> Option<Direction> {
        if token_s == self.token_a && token_b == self.token_b {
            Some(Direction::AToB)
        } else if token_s == self.token_b && token_b == self.token_a {
            Some(Direction::BToA)
        } else {
            None
        }
    }
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::AToB => Direction::BToA,
            Direction::BToA => Direction::AToB,
        }
    }
}

impl fmt::Display for MarketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}", self.token_a, self.token_b)
    }
}
