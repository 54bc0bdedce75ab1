//! Tentative fills of rings that are committed but not yet settled.
//!
//! The matcher adds these amounts on top of ledger-confirmed order state so
//! that the same liquidity is not promised to two rings at once. Entries are
//! keyed by ring hash; committing a ring twice or releasing it twice is a
//! no-op.

use crate::domain::{OrderHash, Ring, RingHash};
use crate::events::RingSubmitResultEvent;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use num_rational::BigRational;
use num_traits::Zero;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Member of a committed ring, as needed for release
#[derive(Debug, Clone)]
struct Member {
    order: OrderHash,
    owner: Address,
    token_s: Address,
}

/// Fill amounts a ring reserved on one order
#[derive(Debug, Clone)]
struct Reserved {
    fill_s: BigRational,
    fill_b: BigRational,
}

/// Shared cache of committed-but-unsettled fills
#[derive(Debug, Default)]
pub struct MatchedStateCache {
    rings: DashMap<RingHash, Vec<Member>>,
    orders: DashMap<OrderHash, HashMap<RingHash, Reserved>>,
    owners: DashMap<(Address, Address), HashSet<OrderHash>>,
}

impl MatchedStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the ring's fill amounts on each member order.
    ///
    /// The ring key stays claimed while member entries are written, so a
    /// concurrent `release` of the same ring waits for the whole commit.
    pub fn commit(&self, ring: &Ring) {
        let slot = match self.rings.entry(ring.hash) {
            Entry::Occupied(_) => {
                debug!("Ring {:?} already committed", ring.hash);
                return;
            }
            Entry::Vacant(slot) => slot,
        };

        let mut members = Vec::with_capacity(ring.orders.len());
        for filled in &ring.orders {
            let order = filled.order();
            members.push(Member {
                order: order.hash,
                owner: order.owner,
                token_s: order.token_s,
            });

            self.orders.entry(order.hash).or_default().insert(
                ring.hash,
                Reserved {
                    fill_s: filled.fill_amount_s.clone(),
                    fill_b: filled.fill_amount_b.clone(),
                },
            );
            self.owners
                .entry((order.owner, order.token_s))
                .or_default()
                .insert(order.hash);
        }

        slot.insert(members);
        debug!("Committed ring {:?} with {} orders", ring.hash, ring.orders.len());
    }

    /// Tentative `(sell, buy)` amounts reserved on an order by all live rings
    pub fn dealt_amount(&self, order: &OrderHash) -> (BigRational, BigRational) {
        match self.orders.get(order) {
            Some(rings) => rings.values().fold(
                (BigRational::zero(), BigRational::zero()),
                |(s, b), reserved| (s + &reserved.fill_s, b + &reserved.fill_b),
            ),
            None => (BigRational::zero(), BigRational::zero()),
        }
    }

    /// Sell-token amount an owner has reserved across all live rings
    pub fn filled_amount_s(&self, owner: Address, token: Address) -> BigRational {
        let hashes: Vec<OrderHash> = match self.owners.get(&(owner, token)) {
            Some(set) => set.iter().copied().collect(),
            None => return BigRational::zero(),
        };
        hashes
            .iter()
            .map(|hash| self.dealt_amount(hash).0)
            .fold(BigRational::zero(), |acc, s| acc + s)
    }

    /// Drops everything a ring reserved. Returns false if it was not committed.
    pub fn release(&self, ring_hash: &RingHash) -> bool {
        let Some((_, members)) = self.rings.remove(ring_hash) else {
            return false;
        };

        for member in members {
            let order_empty = match self.orders.get_mut(&member.order) {
                Some(mut rings) => {
                    rings.remove(ring_hash);
                    rings.is_empty()
                }
                None => false,
            };
            if order_empty {
                self.orders.remove_if(&member.order, |_, rings| rings.is_empty());
                let key = (member.owner, member.token_s);
                let owner_empty = match self.owners.get_mut(&key) {
                    Some(mut set) => {
                        if !self.orders.contains_key(&member.order) {
                            set.remove(&member.order);
                        }
                        set.is_empty()
                    }
                    None => false,
                };
                if owner_empty {
                    self.owners.remove_if(&key, |_, set| set.is_empty());
                }
            }
        }

        debug!("Released ring {:?}", ring_hash);
        true
    }

    /// Applies a submission outcome. Every outcome releases the ring:
    /// mined fills are now part of ledger-confirmed state, failed ones
    /// never happened.
    pub fn apply(&self, event: &RingSubmitResultEvent) -> bool {
        self.release(&event.ring_hash)
    }

    pub fn contains_ring(&self, ring_hash: &RingHash) -> bool {
        self.rings.contains_key(ring_hash)
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}
