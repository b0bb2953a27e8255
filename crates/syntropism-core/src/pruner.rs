use chrono::{DateTime, Utc};
use tracing::info;

use crate::attention::AttentionSlot;
use crate::book::BidBook;
use crate::error::EconomyError;
use crate::ledger::Ledger;
use crate::types::{AgentId, Credits};

/// Marks agents Dead once they can no longer take part in the market.
///
/// An agent is pruned when it is Alive, its balance is below
/// `min_viable_balance`, it has no Pending bid and it does not hold the
/// attention slot. Dead agents are never deleted.
#[derive(Debug, Clone, Copy)]
pub struct Pruner {
    min_viable_balance: Credits,
}

impl Pruner {
    pub fn new(min_viable_balance: Credits) -> Self {
        Self { min_viable_balance }
    }

    pub fn candidates(
        &self,
        ledger: &Ledger,
        book: &BidBook,
        slot: &AttentionSlot,
    ) -> Vec<AgentId> {
        ledger
            .agents()
            .filter(|agent| agent.is_alive())
            .filter(|agent| agent.balance < self.min_viable_balance)
            .filter(|agent| !book.has_pending(&agent.id))
            .filter(|agent| !slot.is_held_by(&agent.id))
            .map(|agent| agent.id.clone())
            .collect()
    }

    pub fn prune(
        &self,
        ledger: &mut Ledger,
        book: &BidBook,
        slot: &AttentionSlot,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentId>, EconomyError> {
        let doomed = self.candidates(ledger, book, slot);
        for id in &doomed {
            ledger.mark_dead(id, now)?;
            info!(agent = %id, "Agent terminated");
        }
        Ok(doomed)
    }
}
