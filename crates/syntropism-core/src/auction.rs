//! Auction clearer.
//!
//! One cycle runs `Collecting → Sorting → Allocating → Settling → Pricing →
//! Pruning` against an `EconomyState` and returns to `Idle`. The clearer
//! mutates the state in place; the engine hands it a working copy so an
//! aborted cycle leaves nothing behind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attention::{Prompt, PromptDelivery};
use crate::config::{EconomyConfig, SettlementFailurePolicy};
use crate::error::EconomyError;
use crate::market::{Market, PriceUpdate};
use crate::pruner::Pruner;
use crate::state::EconomyState;
use crate::types::{
    AgentId, Bid, BidId, BidScope, BidStatus, Credits, ExecutionGrant, GrantId, PerResource,
    RejectionReason, ResourceAmounts, ResourceType,
};

/// Phases of one clearing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearingPhase {
    Idle,
    Collecting,
    Sorting,
    Allocating,
    Settling,
    Pricing,
    Pruning,
}

impl ClearingPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Sorting => "sorting",
            Self::Allocating => "allocating",
            Self::Settling => "settling",
            Self::Pricing => "pricing",
            Self::Pruning => "pruning",
        }
    }

    fn predecessor(self) -> Self {
        match self {
            Self::Collecting => Self::Idle,
            Self::Sorting => Self::Collecting,
            Self::Allocating => Self::Sorting,
            Self::Settling => Self::Allocating,
            Self::Pricing => Self::Settling,
            Self::Pruning => Self::Pricing,
            Self::Idle => Self::Pruning,
        }
    }
}

/// Enforces the phase order of a clearing cycle.
#[derive(Debug, Clone)]
pub struct ClearingMachine {
    cycle: u64,
    phase: ClearingPhase,
}

impl ClearingMachine {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            phase: ClearingPhase::Idle,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn phase(&self) -> ClearingPhase {
        self.phase
    }

    pub fn advance(&mut self, next: ClearingPhase) -> Result<(), EconomyError> {
        let expected = next.predecessor();
        if self.phase != expected {
            return Err(EconomyError::phase_violation(
                expected.name(),
                self.phase.name(),
            ));
        }
        debug!(cycle = self.cycle, phase = next.name(), "Clearing phase");
        self.phase = next;
        Ok(())
    }
}

/// Highest offer first, then earliest submission, then arrival order.
pub fn sort_bids(bids: &mut [Bid]) {
    bids.sort_by(|a, b| {
        b.total_cost
            .cmp(&a.total_cost)
            .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
}

/// Outcome of one all-or-nothing allocation pass.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub winners: Vec<Bid>,
    /// Bids that did not fit, in the order they were walked.
    pub rejected: Vec<Bid>,
    pub remaining: ResourceAmounts,
}

pub fn fits(bid: &Bid, remaining: &ResourceAmounts) -> bool {
    bid.bundle
        .amounts
        .named()
        .all(|(resource, amount)| amount <= *remaining.get(resource))
}

/// Walk `sorted` once. A bid wins only if every resource it names still has
/// enough remaining capacity; winners take their whole bundle.
pub fn allocate(sorted: &[Bid], capacity: ResourceAmounts) -> Allocation {
    let mut allocation = Allocation {
        remaining: capacity,
        ..Allocation::default()
    };
    for bid in sorted {
        if fits(bid, &allocation.remaining) {
            for (resource, amount) in bid.bundle.amounts.named() {
                *allocation.remaining.get_mut(resource) -= amount;
            }
            allocation.winners.push(bid.clone());
        } else {
            allocation.rejected.push(bid.clone());
        }
    }
    allocation
}

fn give_back(remaining: &mut ResourceAmounts, bid: &Bid) {
    for (resource, amount) in bid.bundle.amounts.named() {
        let slot = remaining.get_mut(resource);
        *slot = slot.saturating_add(amount);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidOutcome {
    pub bid_id: BidId,
    pub agent_id: AgentId,
    pub scope: BidScope,
    pub total_cost: Credits,
    pub status: BidStatus,
    pub rejection: Option<RejectionReason>,
}

impl BidOutcome {
    fn won(bid: &Bid) -> Self {
        Self {
            bid_id: bid.id.clone(),
            agent_id: bid.agent_id.clone(),
            scope: bid.scope(),
            total_cost: bid.total_cost,
            status: BidStatus::Winning,
            rejection: None,
        }
    }

    fn lost(bid: &Bid, reason: RejectionReason) -> Self {
        Self {
            bid_id: bid.id.clone(),
            agent_id: bid.agent_id.clone(),
            scope: bid.scope(),
            total_cost: bid.total_cost,
            status: BidStatus::Rejected,
            rejection: Some(reason),
        }
    }
}

/// Everything one committed cycle decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub winners: Vec<BidOutcome>,
    pub rejected: Vec<BidOutcome>,
    /// Attention bids that lost only to the single slot and stay Pending.
    pub deferred: Vec<BidId>,
    pub grants: Vec<ExecutionGrant>,
    pub prompts_delivered: Vec<PromptDelivery>,
    pub prompts_expired: Vec<Prompt>,
    pub pruned: Vec<AgentId>,
    pub prices: Vec<PriceUpdate>,
}

impl CycleReport {
    fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            winners: Vec::new(),
            rejected: Vec::new(),
            deferred: Vec::new(),
            grants: Vec::new(),
            prompts_delivered: Vec::new(),
            prompts_expired: Vec::new(),
            pruned: Vec::new(),
            prices: Vec::new(),
        }
    }

    pub fn total_burned(&self) -> Credits {
        self.winners
            .iter()
            .fold(Credits::ZERO, |acc, outcome| {
                acc.checked_add(outcome.total_cost).unwrap_or(acc)
            })
    }
}

#[derive(Debug, Clone)]
pub struct AuctionClearer {
    settlement_failure: SettlementFailurePolicy,
    enforce_reserve_price: bool,
    attention_timeout: Duration,
    pruner: Pruner,
    strict_invariants: bool,
}

impl AuctionClearer {
    pub fn new(config: &EconomyConfig) -> Self {
        Self {
            settlement_failure: config.clearing.settlement_failure,
            enforce_reserve_price: config.clearing.enforce_reserve_price,
            attention_timeout: config.attention.response_timeout(),
            pruner: Pruner::new(config.pruning.min_viable_balance),
            strict_invariants: config.invariants.strict,
        }
    }

    /// Run one full clearing cycle.
    pub fn run(
        &self,
        state: &mut EconomyState,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, EconomyError> {
        let cycle = state.cycle + 1;
        let mut machine = ClearingMachine::new(cycle);
        let mut report = CycleReport::new(cycle, now);

        machine.advance(ClearingPhase::Collecting)?;
        report.prompts_expired = state.attention.expire_overdue(now);
        let mut collected = state.bids.pending(BidScope::Execution);
        if state.attention.is_free() {
            collected.extend(state.bids.pending(BidScope::Attention));
        }
        let (mut live, orphaned): (Vec<Bid>, Vec<Bid>) =
            collected.into_iter().partition(|bid| {
                state
                    .ledger
                    .agent(&bid.agent_id)
                    .is_some_and(|agent| agent.is_alive())
            });
        for bid in &orphaned {
            self.reject(state, &mut report, bid, RejectionReason::AgentTerminated, cycle)?;
        }

        machine.advance(ClearingPhase::Sorting)?;
        sort_bids(&mut live);

        machine.advance(ClearingPhase::Allocating)?;
        let mut priced = Vec::with_capacity(live.len());
        for bid in live {
            if self.enforce_reserve_price {
                let quote = state.market.quote(&bid.bundle)?;
                if bid.total_cost < quote {
                    self.reject(state, &mut report, &bid, RejectionReason::BelowReservePrice, cycle)?;
                    continue;
                }
            }
            priced.push(bid);
        }
        let capacity = ResourceAmounts::from_fn(|resource| state.market.available_supply(resource));
        let Allocation {
            winners,
            rejected: mut outbid,
            mut remaining,
        } = allocate(&priced, capacity);

        machine.advance(ClearingPhase::Settling)?;
        let mut settled = Vec::with_capacity(winners.len());
        let failures = self.settle(state, &mut report, winners, &mut remaining, &mut settled, now)?;
        if failures > 0 && self.settlement_failure == SettlementFailurePolicy::ReofferOnce {
            debug!(cycle, failures, "Re-offering capacity freed by failed settlements");
            let second = allocate(&outbid, remaining);
            remaining = second.remaining;
            outbid = second.rejected;
            self.settle(state, &mut report, second.winners, &mut remaining, &mut settled, now)?;
        }
        for bid in &outbid {
            if bid.scope() == BidScope::Attention {
                report.deferred.push(bid.id.clone());
                continue;
            }
            self.reject(state, &mut report, bid, RejectionReason::InsufficientCapacity, cycle)?;
        }
        for bid in &settled {
            match bid.scope() {
                BidScope::Execution => {
                    state.ledger.record_execution(&bid.agent_id, now)?;
                    report.grants.push(ExecutionGrant {
                        grant_id: GrantId::generate(),
                        bid_id: bid.id.clone(),
                        agent_id: bid.agent_id.clone(),
                        bundle: bid.bundle.clone(),
                        cost: bid.total_cost,
                        cycle,
                        granted_at: now,
                    });
                }
                BidScope::Attention => {
                    let delivery =
                        state
                            .attention
                            .deliver(bid, cycle, self.attention_timeout, now)?;
                    report.prompts_delivered.push(delivery);
                }
            }
        }

        machine.advance(ClearingPhase::Pricing)?;
        self.reprice(state, &mut report, &settled, now)?;

        machine.advance(ClearingPhase::Pruning)?;
        report.pruned = self
            .pruner
            .prune(&mut state.ledger, &state.bids, &state.attention, now)?;
        self.check_conservation(state)?;

        machine.advance(ClearingPhase::Idle)?;
        state.cycle = cycle;

        info!(
            cycle,
            winners = report.winners.len(),
            rejected = report.rejected.len(),
            grants = report.grants.len(),
            prompts = report.prompts_delivered.len(),
            pruned = report.pruned.len(),
            burned = %report.total_burned(),
            "Clearing cycle complete"
        );
        Ok(report)
    }

    /// Burn each winner's cost. A failed settlement demotes the bid and gives
    /// its capacity back to `remaining`. Returns the number of failures.
    fn settle(
        &self,
        state: &mut EconomyState,
        report: &mut CycleReport,
        winners: Vec<Bid>,
        remaining: &mut ResourceAmounts,
        settled: &mut Vec<Bid>,
        now: DateTime<Utc>,
    ) -> Result<usize, EconomyError> {
        let cycle = report.cycle;
        let mut failures = 0;
        for bid in winners {
            let memo = match bid.scope() {
                BidScope::Execution => "resource purchase",
                BidScope::Attention => "attention purchase",
            };
            match state.ledger.settle_bid(&bid, memo, now) {
                Ok(_) => {
                    state.bids.mark_winning(&bid.id, cycle)?;
                    debug!(bid = %bid.id, agent = %bid.agent_id, amount = %bid.total_cost, "Bid won");
                    report.winners.push(BidOutcome::won(&bid));
                    settled.push(bid);
                }
                Err(EconomyError::ConcurrentBalanceChange { .. }) => {
                    give_back(remaining, &bid);
                    self.reject(
                        state,
                        report,
                        &bid,
                        RejectionReason::ConcurrentBalanceChange,
                        cycle,
                    )?;
                    failures += 1;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(failures)
    }

    fn reject(
        &self,
        state: &mut EconomyState,
        report: &mut CycleReport,
        bid: &Bid,
        reason: RejectionReason,
        cycle: u64,
    ) -> Result<(), EconomyError> {
        state.ledger.release(&bid.id);
        state.bids.reject(&bid.id, reason, cycle)?;
        debug!(bid = %bid.id, agent = %bid.agent_id, reason = ?reason, "Bid rejected");
        report.rejected.push(BidOutcome::lost(bid, reason));
        Ok(())
    }

    fn reprice(
        &self,
        state: &mut EconomyState,
        report: &mut CycleReport,
        settled: &[Bid],
        now: DateTime<Utc>,
    ) -> Result<(), EconomyError> {
        let mut allocated = ResourceAmounts::default();
        let mut paid: PerResource<Credits> = PerResource::default();
        let mut capacity_ms: PerResource<u128> = PerResource::default();
        for bid in settled {
            let shares = cost_shares(&state.market, bid)?;
            for (resource, amount) in bid.bundle.amounts.named() {
                *allocated.get_mut(resource) += amount;
                let credits = paid.get_mut(resource);
                *credits = credits
                    .checked_add(*shares.get(resource))
                    .ok_or_else(|| EconomyError::overflow("clearing price"))?;
                *capacity_ms.get_mut(resource) += amount as u128 * bid.bundle.duration_ms as u128;
            }
        }
        // A prompt granted in an earlier cycle is not fresh demand.
        let holding_over = !state.attention.is_free()
            && !settled.iter().any(|bid| bid.scope() == BidScope::Attention);

        for resource in ResourceType::ALL {
            if resource == ResourceType::Attention && holding_over {
                continue;
            }
            let mut update =
                state
                    .market
                    .apply_utilization_update(resource, *allocated.get(resource), now);
            if let Some(clearing) = state.market.apply_clearing_price(
                resource,
                *paid.get(resource),
                *capacity_ms.get(resource),
                now,
            ) {
                update.new_price = clearing.new_price;
                update.version = clearing.version;
            }
            report.prices.push(update);
        }
        Ok(())
    }

    fn check_conservation(&self, state: &EconomyState) -> Result<(), EconomyError> {
        match state.ledger.check_conservation() {
            Ok(_) => Ok(()),
            Err(err) if self.strict_invariants => panic!("{}", err),
            Err(err) => Err(err),
        }
    }
}

/// Split a winner's cost across the resources it names, in proportion to each
/// resource's part of the bundle's quote. The shares sum to `total_cost`; the
/// rounding remainder goes to the largest part.
fn cost_shares(market: &Market, bid: &Bid) -> Result<PerResource<Credits>, EconomyError> {
    let duration = bid.bundle.duration_ms as u128;
    let terms = PerResource::from_fn(|resource| {
        bid.bundle.amount(resource) as u128 * market.price(resource).minor() as u128 * duration
    });
    let total: u128 = terms.iter().map(|(_, term)| *term).sum();
    let cost = bid.total_cost.minor() as u128;

    let mut shares: PerResource<Credits> = PerResource::default();
    if total == 0 {
        return Ok(shares);
    }
    let mut assigned: u128 = 0;
    let mut largest = ResourceType::Cpu;
    for (resource, term) in terms.iter() {
        if *term > *terms.get(largest) {
            largest = resource;
        }
        let share = cost * *term / total;
        assigned += share;
        *shares.get_mut(resource) = Credits::from_minor(
            u64::try_from(share).map_err(|_| EconomyError::overflow("clearing price"))?,
        );
    }
    let remainder = u64::try_from(cost - assigned)
        .map_err(|_| EconomyError::overflow("clearing price"))?;
    let top = shares.get_mut(largest);
    *top = top
        .checked_add(Credits::from_minor(remainder))
        .ok_or_else(|| EconomyError::overflow("clearing price"))?;
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingPolicy;
    use crate::ledger::Account;
    use crate::types::{BidRequest, ResourceBundle};

    fn state(config: &EconomyConfig, agents: &[(&str, u64)]) -> EconomyState {
        let mut state = EconomyState::new(config);
        for (id, credits) in agents {
            state
                .register_agent(Some(AgentId::new(*id)), Credits::from_credits(*credits), Utc::now())
                .unwrap();
        }
        state
    }

    fn place(
        state: &mut EconomyState,
        config: &EconomyConfig,
        agent: &str,
        bundle: ResourceBundle,
        offer: u64,
    ) -> Bid {
        state
            .submit_bid(
                BidRequest::new(agent, bundle, Credits::from_credits(offer)),
                &config.clearing,
                Utc::now(),
            )
            .unwrap()
    }

    fn bare_bid(id: &str, cost: u64, seq: u64, at: DateTime<Utc>) -> Bid {
        Bid {
            id: BidId::new(id),
            agent_id: AgentId::new(id),
            bundle: ResourceBundle::new(1_000).with(ResourceType::Cpu, 1),
            total_cost: Credits::from_credits(cost),
            quoted_at_submission: Credits::ZERO,
            status: BidStatus::Pending,
            submitted_at: at,
            sequence: seq,
            prompt: None,
            rejection: None,
            decided_in_cycle: None,
        }
    }

    fn cpu(amount: u64) -> ResourceBundle {
        ResourceBundle::new(1_000).with(ResourceType::Cpu, amount)
    }

    #[test]
    fn phases_must_run_in_order() {
        let mut machine = ClearingMachine::new(1);
        machine.advance(ClearingPhase::Collecting).unwrap();
        let err = machine.advance(ClearingPhase::Allocating).unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'sorting', got 'collecting'"));

        for phase in [
            ClearingPhase::Sorting,
            ClearingPhase::Allocating,
            ClearingPhase::Settling,
            ClearingPhase::Pricing,
            ClearingPhase::Pruning,
            ClearingPhase::Idle,
        ] {
            machine.advance(phase).unwrap();
        }
        assert_eq!(machine.phase(), ClearingPhase::Idle);
    }

    #[test]
    fn sort_prefers_cost_then_time_then_arrival() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::milliseconds(5);
        let mut bids = vec![
            bare_bid("late-equal", 50, 0, t1),
            bare_bid("cheap", 10, 1, t0),
            bare_bid("early-equal", 50, 2, t0),
            bare_bid("same-time", 50, 3, t0),
            bare_bid("rich", 90, 4, t1),
        ];
        sort_bids(&mut bids);
        let order: Vec<&str> = bids.iter().map(|bid| bid.id.as_str()).collect();
        assert_eq!(
            order,
            vec!["rich", "early-equal", "same-time", "late-equal", "cheap"]
        );
    }

    #[test]
    fn allocation_is_all_or_nothing() {
        let now = Utc::now();
        let mut big = bare_bid("big", 90, 0, now);
        big.bundle = ResourceBundle::new(1_000)
            .with(ResourceType::Cpu, 8)
            .with(ResourceType::Memory, 512);
        let mut blocked = bare_bid("blocked", 50, 1, now);
        blocked.bundle = ResourceBundle::new(1_000)
            .with(ResourceType::Cpu, 1)
            .with(ResourceType::Memory, 600);
        let mut small = bare_bid("small", 10, 2, now);
        small.bundle = cpu(2);

        let capacity = ResourceAmounts::default()
            .with(ResourceType::Cpu, 10)
            .with(ResourceType::Memory, 1_024);
        let allocation = allocate(&[big, blocked, small], capacity);

        let winners: Vec<&str> = allocation.winners.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(winners, vec!["big", "small"]);
        assert_eq!(allocation.rejected[0].id, BidId::new("blocked"));
        // Rejected bid took nothing.
        assert_eq!(allocation.remaining.cpu, 0);
        assert_eq!(allocation.remaining.memory, 512);
    }

    #[test]
    fn single_bidder_wins_and_pays() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100)]);
        let bid = place(&mut state, &config, "a", cpu(1), 50);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();

        assert_eq!(state.ledger.balance(&"a".into()).unwrap(), Credits::from_credits(50));
        assert_eq!(state.bids.get(&bid.id).unwrap().status, BidStatus::Winning);
        assert_eq!(report.grants.len(), 1);
        assert_eq!(report.grants[0].agent_id, AgentId::new("a"));
        assert!((state.market.utilization(ResourceType::Cpu) - 0.1).abs() < 1e-9);
        assert_eq!(state.cycle, 1);
        assert_eq!(state.ledger.agent(&"a".into()).unwrap().execution_count, 1);
    }

    #[test]
    fn higher_offer_takes_scarce_tokens() {
        let mut config = EconomyConfig::default();
        config.market.resources.tokens.available_supply = 100;
        let mut state = state(&config, &[("a", 100), ("b", 100)]);
        let tokens = ResourceBundle::new(1_000).with(ResourceType::Tokens, 100);
        let low = place(&mut state, &config, "a", tokens.clone(), 30);
        let high = place(&mut state, &config, "b", tokens, 50);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();

        assert_eq!(state.bids.get(&high.id).unwrap().status, BidStatus::Winning);
        let lost = state.bids.get(&low.id).unwrap();
        assert_eq!(lost.status, BidStatus::Rejected);
        assert_eq!(lost.rejection, Some(RejectionReason::InsufficientCapacity));
        assert_eq!(state.ledger.balance(&"b".into()).unwrap(), Credits::from_credits(50));
        assert_eq!(state.ledger.balance(&"a".into()).unwrap(), Credits::from_credits(100));
        assert_eq!(state.ledger.available(&"a".into()).unwrap(), Credits::from_credits(100));
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn equal_offers_go_to_the_earlier_bid() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100), ("b", 100)]);
        let first = place(&mut state, &config, "a", cpu(10), 40);
        let second = place(&mut state, &config, "b", cpu(10), 40);

        AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        assert_eq!(state.bids.get(&first.id).unwrap().status, BidStatus::Winning);
        assert_eq!(state.bids.get(&second.id).unwrap().status, BidStatus::Rejected);
    }

    fn unreserved(state: &mut EconomyState, agent: &str, bundle: ResourceBundle, cost: u64) -> BidId {
        let sequence = state.bids.next_sequence();
        let id = BidId::new(format!("unreserved-{}", sequence));
        state
            .bids
            .insert(Bid {
                id: id.clone(),
                agent_id: AgentId::new(agent),
                bundle,
                total_cost: Credits::from_credits(cost),
                quoted_at_submission: Credits::ZERO,
                status: BidStatus::Pending,
                submitted_at: Utc::now(),
                sequence,
                prompt: None,
                rejection: None,
                decided_in_cycle: None,
            })
            .unwrap();
        id
    }

    #[test]
    fn failed_settlement_forfeits_capacity_by_default() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("poor", 5), ("b", 100)]);
        // Bypasses reservation so settlement finds the balance short.
        let broke = unreserved(&mut state, "poor", cpu(10), 90);
        let fallback = place(&mut state, &config, "b", cpu(10), 20);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();

        let failed = state.bids.get(&broke).unwrap();
        assert_eq!(failed.rejection, Some(RejectionReason::ConcurrentBalanceChange));
        let outbid = state.bids.get(&fallback.id).unwrap();
        assert_eq!(outbid.rejection, Some(RejectionReason::InsufficientCapacity));
        assert!(report.grants.is_empty());
        assert_eq!(state.ledger.balance(&"poor".into()).unwrap(), Credits::from_credits(5));
    }

    #[test]
    fn reoffer_once_hands_freed_capacity_to_next_bid() {
        let mut config = EconomyConfig::default();
        config.clearing.settlement_failure = SettlementFailurePolicy::ReofferOnce;
        let mut state = state(&config, &[("poor", 5), ("b", 100)]);
        let broke = unreserved(&mut state, "poor", cpu(10), 90);
        let fallback = place(&mut state, &config, "b", cpu(10), 20);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();

        assert_eq!(state.bids.get(&broke).unwrap().status, BidStatus::Rejected);
        assert_eq!(state.bids.get(&fallback.id).unwrap().status, BidStatus::Winning);
        assert_eq!(report.grants.len(), 1);
        assert_eq!(state.ledger.balance(&"b".into()).unwrap(), Credits::from_credits(80));
    }

    #[test]
    fn bids_below_new_reserve_price_are_rejected() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100)]);
        let bid = place(&mut state, &config, "a", cpu(1), 1);
        // Price rises after submission.
        state.market.apply_utilization_update(ResourceType::Cpu, 10, Utc::now());

        AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        let bid = state.bids.get(&bid.id).unwrap();
        assert_eq!(bid.rejection, Some(RejectionReason::BelowReservePrice));
        assert_eq!(state.ledger.available(&"a".into()).unwrap(), Credits::from_credits(100));
    }

    #[test]
    fn attention_winner_holds_slot_and_losers_wait() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100), ("b", 100)]);
        let prompt = serde_json::json!({"text": "hi"});
        let submit = |state: &mut EconomyState, agent: &str, offer: u64| {
            state
                .submit_bid(
                    BidRequest::new(agent, ResourceBundle::attention(1_000), Credits::from_credits(offer))
                        .with_prompt(prompt.clone()),
                    &config.clearing,
                    Utc::now(),
                )
                .unwrap()
        };
        let winner = submit(&mut state, "a", 30);
        let waiting = submit(&mut state, "b", 20);
        let clearer = AuctionClearer::new(&config);

        let now = Utc::now();
        let report = clearer.run(&mut state, now).unwrap();
        assert_eq!(report.prompts_delivered.len(), 1);
        assert_eq!(report.prompts_delivered[0].agent_id, AgentId::new("a"));
        assert!(report.grants.is_empty());
        assert_eq!(report.deferred, vec![waiting.id.clone()]);
        assert_eq!(state.bids.get(&winner.id).unwrap().status, BidStatus::Winning);
        assert!(state.bids.get(&waiting.id).unwrap().is_pending());
        assert_eq!(state.ledger.balance(&"a".into()).unwrap(), Credits::from_credits(70));
        assert_eq!(state.market.utilization(ResourceType::Attention), 1.0);

        // Slot still held: the waiting bid is not even collected.
        let report = clearer.run(&mut state, now + Duration::seconds(1)).unwrap();
        assert!(report.prompts_delivered.is_empty());
        assert!(state.bids.get(&waiting.id).unwrap().is_pending());

        // Timeout frees the slot for the next bidder.
        let later = now + Duration::milliseconds(config.attention.response_timeout_ms as i64);
        let report = clearer.run(&mut state, later).unwrap();
        assert_eq!(report.prompts_expired.len(), 1);
        assert_eq!(report.prompts_delivered[0].agent_id, AgentId::new("b"));
        assert_eq!(state.ledger.balance(&"a".into()).unwrap(), Credits::from_credits(70));
    }

    #[test]
    fn broke_idle_agent_is_pruned_after_cycle() {
        let mut config = EconomyConfig::default();
        config.pruning.min_viable_balance = Credits::from_credits(2);
        let mut state = state(&config, &[("a", 1), ("b", 100)]);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        assert_eq!(report.pruned, vec![AgentId::new("a")]);
        assert!(!state.ledger.agent(&"a".into()).unwrap().is_alive());
        assert!(state.ledger.agent(&"b".into()).unwrap().is_alive());
    }

    #[test]
    fn agent_spending_everything_dies_after_winning() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 50)]);
        place(&mut state, &config, "a", cpu(1), 50);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        assert_eq!(report.grants.len(), 1);
        assert_eq!(report.pruned, vec![AgentId::new("a")]);
    }

    #[test]
    fn marginal_clearing_reprices_from_winning_offers() {
        let mut config = EconomyConfig::default();
        config.market.pricing = PricingPolicy::MarginalClearing;
        let mut state = state(&config, &[("a", 500), ("b", 500)]);
        place(&mut state, &config, "a", ResourceBundle::new(10_000).with(ResourceType::Cpu, 1), 100);
        place(&mut state, &config, "b", ResourceBundle::new(5_000).with(ResourceType::Cpu, 2), 100);

        let report = AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        assert_eq!(report.winners.len(), 2);
        assert_eq!(state.market.price(ResourceType::Cpu), Credits::from_credits(10));
        // Untouched resources keep their price.
        assert_eq!(state.market.price(ResourceType::Memory), Credits::from_minor(1));
    }

    #[test]
    fn marginal_clearing_splits_cost_across_bundle_resources() {
        let mut config = EconomyConfig::default();
        config.market.pricing = PricingPolicy::MarginalClearing;
        let mut state = state(&config, &[("a", 100)]);
        let bundle = ResourceBundle::new(1_000)
            .with(ResourceType::Cpu, 1)
            .with(ResourceType::Memory, 1);
        place(&mut state, &config, "a", bundle.clone(), 10);

        let clearer = AuctionClearer::new(&config);
        let report = clearer.run(&mut state, Utc::now()).unwrap();
        assert_eq!(report.winners.len(), 1);
        assert_eq!(state.market.price(ResourceType::Cpu), Credits::from_minor(9_991));
        assert_eq!(state.market.price(ResourceType::Memory), Credits::from_minor(9));
        assert_eq!(state.market.quote(&bundle).unwrap(), Credits::from_credits(10));

        // The same bundle at the same offer still clears at the new prices.
        let again = place(&mut state, &config, "a", bundle, 10);
        let report = clearer.run(&mut state, Utc::now()).unwrap();
        assert_eq!(report.winners.len(), 1);
        assert_eq!(state.bids.get(&again.id).unwrap().status, BidStatus::Winning);
    }

    #[test]
    fn held_slot_does_not_inflate_attention_price() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100), ("b", 100)]);
        let prompt = serde_json::json!({"text": "hi"});
        let t0 = Utc::now();
        for (agent, offer) in [("a", 30), ("b", 20)] {
            state
                .submit_bid(
                    BidRequest::new(agent, ResourceBundle::attention(1_000), Credits::from_credits(offer))
                        .with_prompt(prompt.clone()),
                    &config.clearing,
                    t0,
                )
                .unwrap();
        }
        let clearer = AuctionClearer::new(&config);
        clearer.run(&mut state, t0).unwrap();
        let granted_price = state.market.price(ResourceType::Attention);
        assert_eq!(granted_price, Credits::from_credits(11));

        // One-second ticks for the whole response window.
        let window_secs = config.attention.response_timeout_ms as i64 / 1_000;
        let mut last = None;
        for tick in 1..=window_secs {
            let report = clearer.run(&mut state, t0 + Duration::seconds(tick)).unwrap();
            if tick < window_secs {
                assert_eq!(state.market.price(ResourceType::Attention), granted_price);
            }
            last = Some(report);
        }

        let last = last.unwrap();
        assert_eq!(last.prompts_expired.len(), 1);
        assert_eq!(last.prompts_delivered.len(), 1);
        assert_eq!(last.prompts_delivered[0].agent_id, AgentId::new("b"));
        assert!(last.rejected.is_empty());
    }

    #[test]
    fn conservation_holds_after_busy_cycle() {
        let config = EconomyConfig::default();
        let mut state = state(&config, &[("a", 100), ("b", 100), ("c", 100)]);
        place(&mut state, &config, "a", cpu(6), 40);
        place(&mut state, &config, "b", cpu(6), 45);
        place(&mut state, &config, "c", cpu(4), 30);
        state
            .ledger
            .transfer(&Account::agent("c"), &Account::agent("a"), Credits::from_credits(10), "tip", Utc::now())
            .unwrap();

        AuctionClearer::new(&config).run(&mut state, Utc::now()).unwrap();
        assert!(state.ledger.audit().is_clean());
    }
}
