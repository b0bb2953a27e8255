//! The complete mutable state of one economy, and the synchronous operations
//! on it.
//!
//! `Economy` applies each operation to a clone of this value, commits the
//! clone and only then swaps it in, so every method here may fail halfway
//! without the caller observing a partial effect.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::attention::{AttentionSlot, ScoredPrompt};
use crate::book::BidBook;
use crate::config::{ClearingConfig, EconomyConfig, ScoreWeights};
use crate::error::EconomyError;
use crate::ledger::{Account, Ledger, Transaction};
use crate::market::Market;
use crate::storage::{EconomySnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::types::{
    Agent, AgentId, Bid, BidId, BidRequest, BidStatus, Credits, HumanResponse, ResourceBundle,
    ResourceType,
};

#[derive(Debug, Clone)]
pub struct EconomyState {
    /// Last fully committed cycle.
    pub cycle: u64,
    pub ledger: Ledger,
    pub bids: BidBook,
    pub market: Market,
    pub attention: AttentionSlot,
}

/// Result of a spawn: the child plus the two ledger entries paid by the parent.
#[derive(Debug, Clone)]
pub struct Spawned {
    pub child: Agent,
    pub fee: Option<Transaction>,
    pub endowment: Option<Transaction>,
}

/// Result of scoring a prompt.
#[derive(Debug, Clone)]
pub struct AttentionSettlement {
    pub scored: ScoredPrompt,
    /// `None` when the reward was zero.
    pub transaction: Option<Transaction>,
}

impl EconomyState {
    pub fn new(config: &EconomyConfig) -> Self {
        Self {
            cycle: 0,
            ledger: Ledger::new(),
            bids: BidBook::new(),
            market: Market::new(config.market.clone()),
            attention: AttentionSlot::new(),
        }
    }

    /// Rebuild from a persisted snapshot, re-verifying the ledger.
    pub fn from_snapshot(
        snapshot: EconomySnapshot,
        config: &EconomyConfig,
    ) -> Result<Self, EconomyError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(EconomyError::StructuralFailure(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }
        Ok(Self {
            cycle: snapshot.cycle,
            ledger: snapshot.ledger.restore()?,
            bids: snapshot.bids,
            market: Market::from_states(config.market.clone(), snapshot.market),
            attention: snapshot.attention,
        })
    }

    pub fn to_snapshot(&self, now: DateTime<Utc>) -> EconomySnapshot {
        EconomySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            cycle: self.cycle,
            saved_at: now,
            ledger: self.ledger.clone(),
            bids: self.bids.clone(),
            market: self.market.states().clone(),
            attention: self.attention.clone(),
        }
    }

    pub fn register_agent(
        &mut self,
        id: Option<AgentId>,
        endowment: Credits,
        now: DateTime<Utc>,
    ) -> Result<Agent, EconomyError> {
        let id = id.unwrap_or_else(AgentId::generate);
        if id.as_str().trim().is_empty() {
            return Err(EconomyError::InvalidAgentId("agent id must not be empty".into()));
        }
        Ok(self.ledger.open_account(id, endowment, Vec::new(), now)?.clone())
    }

    /// Create a child agent paid for by `parent`: the spawn fee is burned and
    /// `initial_credits` move to the child.
    pub fn spawn_agent(
        &mut self,
        parent: &AgentId,
        child_id: Option<AgentId>,
        initial_credits: Credits,
        spawn_cost: Credits,
        now: DateTime<Utc>,
    ) -> Result<Spawned, EconomyError> {
        let parent_agent = self
            .ledger
            .agent(parent)
            .ok_or_else(|| EconomyError::AgentNotFound(parent.clone()))?;
        if !parent_agent.is_alive() {
            return Err(EconomyError::AgentTerminated(parent.clone()));
        }
        let mut lineage = vec![parent.clone()];
        lineage.extend(parent_agent.lineage.iter().cloned());

        let required = spawn_cost
            .checked_add(initial_credits)
            .ok_or_else(|| EconomyError::overflow("spawn cost"))?;
        let available = self.ledger.available(parent)?;
        if available < required {
            return Err(EconomyError::InsufficientFunds {
                agent: parent.clone(),
                requested: required,
                available,
            });
        }

        let child_id = child_id.unwrap_or_else(AgentId::generate);
        self.ledger
            .open_account(child_id.clone(), Credits::ZERO, lineage, now)?;

        let fee = if spawn_cost.is_zero() {
            None
        } else {
            Some(self.ledger.transfer(
                &Account::Agent(parent.clone()),
                &Account::Burn,
                spawn_cost,
                "spawn fee",
                now,
            )?)
        };
        let endowment = if initial_credits.is_zero() {
            None
        } else {
            Some(self.ledger.transfer(
                &Account::Agent(parent.clone()),
                &Account::Agent(child_id.clone()),
                initial_credits,
                format!("spawn endowment for {}", child_id),
                now,
            )?)
        };

        let child = self
            .ledger
            .agent(&child_id)
            .cloned()
            .ok_or_else(|| EconomyError::AgentNotFound(child_id.clone()))?;
        debug!(parent = %parent, child = %child.id, "Agent spawned");
        Ok(Spawned {
            child,
            fee,
            endowment,
        })
    }

    /// Agent-to-agent payment.
    pub fn transfer(
        &mut self,
        from: &AgentId,
        to: &AgentId,
        amount: Credits,
        memo: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, EconomyError> {
        self.ledger.transfer(
            &Account::Agent(from.clone()),
            &Account::Agent(to.clone()),
            amount,
            memo,
            now,
        )
    }

    /// Validate a bid, reserve its offer and add it to the book as Pending.
    pub fn submit_bid(
        &mut self,
        request: BidRequest,
        clearing: &ClearingConfig,
        now: DateTime<Utc>,
    ) -> Result<Bid, EconomyError> {
        let agent = self
            .ledger
            .agent(&request.agent_id)
            .ok_or_else(|| EconomyError::AgentNotFound(request.agent_id.clone()))?;
        if !agent.is_alive() {
            return Err(EconomyError::AgentTerminated(request.agent_id.clone()));
        }

        validate_bundle(&request.bundle, &self.market)?;
        if request.offered_total.is_zero() {
            return Err(EconomyError::InvalidOffer(
                "offered_total must be positive".into(),
            ));
        }
        if request.bundle.amount(ResourceType::Attention) > 0 && request.prompt.is_none() {
            return Err(EconomyError::InvalidBundle(
                "attention bids must carry a prompt".into(),
            ));
        }

        let quote = self.market.quote(&request.bundle)?;
        if clearing.enforce_reserve_price && request.offered_total < quote {
            return Err(EconomyError::BelowReservePrice {
                offered: request.offered_total,
                quote,
            });
        }

        let bid_id = BidId::generate();
        self.ledger
            .reserve(bid_id.clone(), &request.agent_id, request.offered_total)?;

        let bid = Bid {
            id: bid_id,
            agent_id: request.agent_id,
            bundle: request.bundle,
            total_cost: request.offered_total,
            quoted_at_submission: quote,
            status: BidStatus::Pending,
            submitted_at: now,
            sequence: self.bids.next_sequence(),
            prompt: request.prompt,
            rejection: None,
            decided_in_cycle: None,
        };
        self.bids.insert(bid.clone())?;
        debug!(
            bid = %bid.id,
            agent = %bid.agent_id,
            amount = %bid.total_cost,
            "Bid accepted"
        );
        Ok(bid)
    }

    /// Withdraw a Pending bid and release its reservation.
    pub fn cancel_bid(&mut self, id: &BidId) -> Result<Bid, EconomyError> {
        let bid = self.bids.cancel(id, self.cycle)?;
        self.ledger.release(id);
        Ok(bid)
    }

    /// Score a delivered prompt and pay the reward from `HUMAN`.
    pub fn respond_to_prompt(
        &mut self,
        response: &HumanResponse,
        weights: &ScoreWeights,
        now: DateTime<Utc>,
    ) -> Result<AttentionSettlement, EconomyError> {
        let scored = self.attention.respond(response, weights, now)?;
        let transaction = if scored.reward.is_zero() {
            None
        } else {
            Some(self.ledger.transfer(
                &Account::Human,
                &Account::Agent(scored.agent_id.clone()),
                scored.reward,
                "attention reward",
                now,
            )?)
        };
        Ok(AttentionSettlement {
            scored,
            transaction,
        })
    }
}

/// Structural bundle checks. Attention bundles hold exactly one attention
/// unit and nothing else; execution bundles name at least one resource.
pub fn validate_bundle(bundle: &ResourceBundle, market: &Market) -> Result<(), EconomyError> {
    if bundle.duration_ms == 0 {
        return Err(EconomyError::InvalidBundle(
            "duration must be positive".into(),
        ));
    }

    let attention = bundle.amount(ResourceType::Attention);
    if attention > 0 {
        if attention != 1 {
            return Err(EconomyError::InvalidBundle(format!(
                "attention bids request exactly one unit, got {}",
                attention
            )));
        }
        if bundle
            .amounts
            .named()
            .any(|(resource, _)| resource != ResourceType::Attention)
        {
            return Err(EconomyError::InvalidBundle(
                "attention cannot be combined with other resources".into(),
            ));
        }
    } else if bundle.amounts.is_empty() {
        return Err(EconomyError::InvalidBundle(
            "bundle names no resource".into(),
        ));
    }

    for (resource, amount) in bundle.amounts.named() {
        let supply = market.available_supply(resource);
        if amount > supply {
            return Err(EconomyError::InvalidBundle(format!(
                "{} requested {} exceeds total supply {}",
                resource, amount, supply
            )));
        }
    }
    Ok(())
}
