//! Bid book: every bid ever accepted, keyed by id. Bids are never removed;
//! decided bids stay for history and audit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EconomyError;
use crate::types::{AgentId, Bid, BidId, BidScope, BidStatus, RejectionReason};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidBook {
    bids: BTreeMap<BidId, Bid>,
    next_sequence: u64,
}

impl BidBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next arrival sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn insert(&mut self, bid: Bid) -> Result<(), EconomyError> {
        if self.bids.contains_key(&bid.id) {
            return Err(EconomyError::InvariantViolation(format!(
                "duplicate bid id {}",
                bid.id
            )));
        }
        self.bids.insert(bid.id.clone(), bid);
        Ok(())
    }

    pub fn get(&self, id: &BidId) -> Option<&Bid> {
        self.bids.get(id)
    }

    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bid> {
        self.bids.values()
    }

    /// Withdraw a Pending bid. Anything already decided is `TooLateToCancel`.
    pub fn cancel(&mut self, id: &BidId, cycle: u64) -> Result<Bid, EconomyError> {
        let bid = self
            .bids
            .get_mut(id)
            .ok_or_else(|| EconomyError::BidNotFound(id.clone()))?;
        if bid.status != BidStatus::Pending {
            return Err(EconomyError::TooLateToCancel(id.clone()));
        }
        bid.status = BidStatus::Cancelled;
        bid.decided_in_cycle = Some(cycle);
        Ok(bid.clone())
    }

    pub fn mark_winning(&mut self, id: &BidId, cycle: u64) -> Result<(), EconomyError> {
        self.decide(id, BidStatus::Winning, None, cycle)
    }

    pub fn reject(
        &mut self,
        id: &BidId,
        reason: RejectionReason,
        cycle: u64,
    ) -> Result<(), EconomyError> {
        self.decide(id, BidStatus::Rejected, Some(reason), cycle)
    }

    fn decide(
        &mut self,
        id: &BidId,
        status: BidStatus,
        rejection: Option<RejectionReason>,
        cycle: u64,
    ) -> Result<(), EconomyError> {
        let bid = self
            .bids
            .get_mut(id)
            .ok_or_else(|| EconomyError::BidNotFound(id.clone()))?;
        if bid.status != BidStatus::Pending {
            return Err(EconomyError::InvariantViolation(format!(
                "bid {} decided twice ({:?} -> {:?})",
                id, bid.status, status
            )));
        }
        bid.status = status;
        bid.rejection = rejection;
        bid.decided_in_cycle = Some(cycle);
        Ok(())
    }

    /// Copies of the Pending bids in one scope, in arrival order.
    pub fn pending(&self, scope: BidScope) -> Vec<Bid> {
        let mut pending: Vec<Bid> = self
            .bids
            .values()
            .filter(|bid| bid.is_pending() && bid.scope() == scope)
            .cloned()
            .collect();
        pending.sort_by_key(|bid| bid.sequence);
        pending
    }

    pub fn has_pending(&self, agent: &AgentId) -> bool {
        self.bids
            .values()
            .any(|bid| bid.is_pending() && &bid.agent_id == agent)
    }

    /// The agent's bids, most recent first.
    pub fn history(&self, agent: &AgentId, limit: usize) -> Vec<Bid> {
        let mut bids: Vec<&Bid> = self
            .bids
            .values()
            .filter(|bid| &bid.agent_id == agent)
            .collect();
        bids.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        bids.into_iter().take(limit).cloned().collect()
    }
}
