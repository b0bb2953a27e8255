//! The `Economy` engine: the single serialization point for ledger, bid book,
//! market and attention slot.
//!
//! Every mutation runs against a clone of the state under one async mutex,
//! is committed to the `StateStore`, and only then replaces the live state.
//! Events and gateway deliveries go out after the commit, outside the lock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::attention::PromptDelivery;
use crate::auction::{AuctionClearer, CycleReport};
use crate::config::EconomyConfig;
use crate::error::EconomyError;
use crate::events::{EconomyEvent, EventBus};
use crate::gateway::{ExecutionGateway, NoopGateway, PromptGateway};
use crate::ledger::{LedgerAudit, Transaction};
use crate::market::MarketSnapshot;
use crate::state::{AttentionSettlement, EconomyState};
use crate::storage::{build_store, StateStore};
use crate::types::{
    Agent, AgentId, Bid, BidId, BidRequest, BidScope, BidStatus, Credits, HumanResponse,
};

pub struct Economy {
    config: EconomyConfig,
    clearer: AuctionClearer,
    state: Mutex<EconomyState>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    execution_gateway: RwLock<Arc<dyn ExecutionGateway>>,
    prompt_gateway: RwLock<Arc<dyn PromptGateway>>,
}

impl Economy {
    /// Validate the configuration, open the configured store and recover
    /// the last committed state if there is one.
    pub async fn bootstrap(config: EconomyConfig) -> Result<Self, EconomyError> {
        let store = build_store(&config.storage);
        Self::with_store(config, store).await
    }

    pub async fn with_store(
        config: EconomyConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EconomyError> {
        config.validate()?;
        let state = match store.load().await? {
            Some(snapshot) => {
                let state = EconomyState::from_snapshot(snapshot, &config)?;
                info!(
                    backend = store.label(),
                    cycle = state.cycle,
                    agents = state.ledger.agents().count(),
                    transactions = state.ledger.log().len(),
                    "Recovered economy state"
                );
                state
            }
            None => EconomyState::new(&config),
        };

        Ok(Self {
            clearer: AuctionClearer::new(&config),
            config,
            state: Mutex::new(state),
            store,
            events: EventBus::default(),
            execution_gateway: RwLock::new(Arc::new(NoopGateway)),
            prompt_gateway: RwLock::new(Arc::new(NoopGateway)),
        })
    }

    pub fn config(&self) -> &EconomyConfig {
        &self.config
    }

    pub fn storage_label(&self) -> &'static str {
        self.store.label()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EconomyEvent> {
        self.events.subscribe()
    }

    pub async fn register_execution_gateway(&self, gateway: Arc<dyn ExecutionGateway>) {
        info!(gateway = gateway.name(), "Execution gateway registered");
        *self.execution_gateway.write().await = gateway;
    }

    pub async fn register_prompt_gateway(&self, gateway: Arc<dyn PromptGateway>) {
        info!(gateway = gateway.name(), "Prompt gateway registered");
        *self.prompt_gateway.write().await = gateway;
    }

    /// Apply `op` to a working copy, commit it, then swap it in.
    async fn apply<T>(
        &self,
        now: DateTime<Utc>,
        op: impl FnOnce(&mut EconomyState) -> Result<T, EconomyError>,
    ) -> Result<T, EconomyError> {
        let mut live = self.state.lock().await;
        let mut working = live.clone();
        let output = op(&mut working)?;
        if let Err(err) = self.store.commit(&working.to_snapshot(now)).await {
            error!(backend = self.store.label(), error = %err, "State commit failed");
            return Err(err.into());
        }
        *live = working;
        Ok(output)
    }

    async fn read<T>(&self, op: impl FnOnce(&EconomyState) -> T) -> T {
        let state = self.state.lock().await;
        op(&state)
    }

    pub async fn register_agent(
        &self,
        id: Option<AgentId>,
        endowment: Credits,
    ) -> Result<Agent, EconomyError> {
        let now = Utc::now();
        let agent = self
            .apply(now, |state| state.register_agent(id, endowment, now))
            .await?;
        info!(agent = %agent.id, endowment = %endowment, "Agent registered");
        self.events.publish(EconomyEvent::AgentRegistered {
            agent_id: agent.id.clone(),
            endowment,
        });
        Ok(agent)
    }

    /// Create the configured genesis agent when the economy has no agents.
    pub async fn ensure_genesis(&self) -> Result<Option<Agent>, EconomyError> {
        let empty = self.read(|state| state.ledger.agents().next().is_none()).await;
        if !empty {
            return Ok(None);
        }
        let spawn = &self.config.spawn;
        self.register_agent(
            Some(AgentId::new(spawn.genesis_agent.clone())),
            spawn.genesis_endowment,
        )
        .await
        .map(Some)
    }

    pub async fn spawn_agent(
        &self,
        parent: &AgentId,
        child_id: Option<AgentId>,
        initial_credits: Credits,
    ) -> Result<Agent, EconomyError> {
        let now = Utc::now();
        let spawn_cost = self.config.spawn.spawn_cost;
        let spawned = self
            .apply(now, |state| {
                state.spawn_agent(parent, child_id, initial_credits, spawn_cost, now)
            })
            .await?;

        info!(parent = %parent, child = %spawned.child.id, amount = %initial_credits, "Agent spawned");
        if let Some(fee) = &spawned.fee {
            self.events.publish(EconomyEvent::CreditsBurned {
                agent_id: parent.clone(),
                amount: fee.amount,
                memo: fee.memo.clone(),
            });
        }
        self.events.publish(EconomyEvent::AgentSpawned {
            parent_id: parent.clone(),
            child_id: spawned.child.id.clone(),
            initial_credits,
            spawn_cost,
        });
        Ok(spawned.child)
    }

    pub async fn transfer(
        &self,
        from: &AgentId,
        to: &AgentId,
        amount: Credits,
        memo: &str,
    ) -> Result<Transaction, EconomyError> {
        let now = Utc::now();
        let tx = self
            .apply(now, |state| state.transfer(from, to, amount, memo, now))
            .await?;
        self.events.publish(EconomyEvent::CreditsTransferred {
            from: from.clone(),
            to: to.clone(),
            amount,
            memo: tx.memo.clone(),
        });
        Ok(tx)
    }

    pub async fn agent(&self, id: &AgentId) -> Result<Agent, EconomyError> {
        self.read(|state| {
            state
                .ledger
                .agent(id)
                .cloned()
                .ok_or_else(|| EconomyError::AgentNotFound(id.clone()))
        })
        .await
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.read(|state| state.ledger.agents().cloned().collect())
            .await
    }

    pub async fn balance(&self, id: &AgentId) -> Result<Credits, EconomyError> {
        self.read(|state| state.ledger.balance(id)).await
    }

    /// Balance minus Pending-bid reservations.
    pub async fn available_balance(&self, id: &AgentId) -> Result<Credits, EconomyError> {
        self.read(|state| state.ledger.available(id)).await
    }

    pub async fn history(
        &self,
        id: &AgentId,
        limit: usize,
    ) -> Result<Vec<Transaction>, EconomyError> {
        self.read(|state| state.ledger.history(id, limit)).await
    }

    pub async fn bid_history(&self, id: &AgentId, limit: usize) -> Result<Vec<Bid>, EconomyError> {
        self.read(|state| {
            if state.ledger.agent(id).is_none() {
                return Err(EconomyError::AgentNotFound(id.clone()));
            }
            Ok(state.bids.history(id, limit))
        })
        .await
    }

    pub async fn bid(&self, id: &BidId) -> Result<Bid, EconomyError> {
        self.read(|state| {
            state
                .bids
                .get(id)
                .cloned()
                .ok_or_else(|| EconomyError::BidNotFound(id.clone()))
        })
        .await
    }

    pub async fn submit_bid(&self, request: BidRequest) -> Result<Bid, EconomyError> {
        let now = Utc::now();
        let clearing = &self.config.clearing;
        let bid = self
            .apply(now, |state| state.submit_bid(request, clearing, now))
            .await?;
        self.events.publish(EconomyEvent::BidPlaced {
            bid_id: bid.id.clone(),
            agent_id: bid.agent_id.clone(),
            total_cost: bid.total_cost,
        });
        Ok(bid)
    }

    /// Withdraw a Pending bid. A cycle in progress holds the state lock, so a
    /// cancellation either lands before its Collecting phase or after it has
    /// decided the bid.
    pub async fn cancel_bid(&self, id: &BidId) -> Result<Bid, EconomyError> {
        let now = Utc::now();
        let bid = self.apply(now, |state| state.cancel_bid(id)).await?;
        self.events.publish(EconomyEvent::BidCancelled {
            bid_id: bid.id.clone(),
            agent_id: bid.agent_id.clone(),
        });
        Ok(bid)
    }

    /// Point-in-time view of every resource market.
    pub async fn market_snapshot(&self) -> MarketSnapshot {
        self.read(|state| state.market.snapshot(state.cycle, Utc::now()))
            .await
    }

    pub async fn pending_prompts(&self) -> Vec<PromptDelivery> {
        self.read(|state| state.attention.pending()).await
    }

    pub async fn respond_to_prompt(
        &self,
        response: HumanResponse,
    ) -> Result<AttentionSettlement, EconomyError> {
        let now = Utc::now();
        let weights = &self.config.attention.weights;
        let settlement = self
            .apply(now, |state| state.respond_to_prompt(&response, weights, now))
            .await?;

        info!(
            prompt = %settlement.scored.prompt_id,
            agent = %settlement.scored.agent_id,
            amount = %settlement.scored.reward,
            "Attention reward settled"
        );
        self.events.publish(EconomyEvent::AttentionRewarded {
            prompt_id: settlement.scored.prompt_id.clone(),
            agent_id: settlement.scored.agent_id.clone(),
            reward: settlement.scored.reward,
        });
        let gateway = self.prompt_gateway.read().await.clone();
        if let Err(err) = gateway.withdraw(&settlement.scored.prompt_id).await {
            warn!(gateway = gateway.name(), error = %err, "Prompt withdrawal failed");
        }
        Ok(settlement)
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, EconomyError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one clearing cycle as of `now`. Any failure aborts the whole cycle
    /// and leaves the committed state untouched.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, EconomyError> {
        let clearer = &self.clearer;
        let report = match self.apply(now, |state| clearer.run(state, now)).await {
            Ok(report) => report,
            Err(err) => {
                let cycle = self.read(|state| state.cycle + 1).await;
                error!(cycle, error = %err, "Clearing cycle aborted");
                self.events.publish(EconomyEvent::CycleAborted {
                    cycle,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        self.publish_cycle(&report);
        self.dispatch(&report).await;
        Ok(report)
    }

    fn publish_cycle(&self, report: &CycleReport) {
        let cycle = report.cycle;
        for outcome in report.winners.iter().chain(report.rejected.iter()) {
            self.events.publish(EconomyEvent::BidProcessed {
                bid_id: outcome.bid_id.clone(),
                agent_id: outcome.agent_id.clone(),
                status: outcome.status,
                rejection: outcome.rejection,
                cycle,
            });
            if outcome.status == BidStatus::Winning {
                let memo = match outcome.scope {
                    BidScope::Execution => "resource purchase",
                    BidScope::Attention => "attention purchase",
                };
                self.events.publish(EconomyEvent::CreditsBurned {
                    agent_id: outcome.agent_id.clone(),
                    amount: outcome.total_cost,
                    memo: memo.to_string(),
                });
            }
        }
        for grant in &report.grants {
            self.events.publish(EconomyEvent::ExecutionGranted {
                bid_id: grant.bid_id.clone(),
                agent_id: grant.agent_id.clone(),
                cost: grant.cost,
                cycle,
            });
        }
        for delivery in &report.prompts_delivered {
            self.events.publish(EconomyEvent::PromptDelivered {
                prompt_id: delivery.prompt_id.clone(),
                agent_id: delivery.agent_id.clone(),
                respond_by: delivery.respond_by,
            });
        }
        for prompt in &report.prompts_expired {
            self.events.publish(EconomyEvent::PromptExpired {
                prompt_id: prompt.id.clone(),
                agent_id: prompt.agent_id.clone(),
            });
        }
        for update in report.prices.iter().filter(|update| update.changed()) {
            self.events.publish(EconomyEvent::PriceDiscovered {
                resource: update.resource,
                previous_price: update.previous_price,
                new_price: update.new_price,
                utilization: update.utilization,
                cycle,
            });
        }
        for agent in &report.pruned {
            self.events.publish(EconomyEvent::AgentTerminated {
                agent_id: agent.clone(),
                cycle,
            });
        }
    }

    async fn dispatch(&self, report: &CycleReport) {
        if !report.grants.is_empty() {
            let gateway = self.execution_gateway.read().await.clone();
            if let Err(err) = gateway.dispatch(&report.grants).await {
                warn!(
                    gateway = gateway.name(),
                    cycle = report.cycle,
                    grants = report.grants.len(),
                    error = %err,
                    "Execution grant dispatch failed"
                );
            }
        }

        if report.prompts_delivered.is_empty() && report.prompts_expired.is_empty() {
            return;
        }
        let gateway = self.prompt_gateway.read().await.clone();
        for prompt in &report.prompts_expired {
            if let Err(err) = gateway.withdraw(&prompt.id).await {
                warn!(gateway = gateway.name(), prompt = %prompt.id, error = %err, "Prompt withdrawal failed");
            }
        }
        for delivery in &report.prompts_delivered {
            if let Err(err) = gateway.deliver(delivery).await {
                warn!(gateway = gateway.name(), prompt = %delivery.prompt_id, error = %err, "Prompt delivery failed");
            }
        }
    }

    pub async fn current_cycle(&self) -> u64 {
        self.read(|state| state.cycle).await
    }

    /// Replay the ledger and check conservation.
    pub async fn audit(&self) -> LedgerAudit {
        self.read(|state| state.ledger.audit()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::storage::{EconomySnapshot, MemoryStateStore, StorageError};
    use crate::types::{
        ExecutionGrant, PromptId, RejectionReason, ResourceBundle, ResourceType, Scores,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn economy(config: EconomyConfig) -> Economy {
        Economy::bootstrap(config).await.unwrap()
    }

    async fn funded(economy: &Economy, id: &str, credits: u64) {
        economy
            .register_agent(Some(AgentId::new(id)), Credits::from_credits(credits))
            .await
            .unwrap();
    }

    fn cpu(amount: u64) -> ResourceBundle {
        ResourceBundle::new(1_000).with(ResourceType::Cpu, amount)
    }

    #[derive(Default)]
    struct RecordingGateway {
        grants: Mutex<Vec<ExecutionGrant>>,
    }

    #[async_trait]
    impl ExecutionGateway for RecordingGateway {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn dispatch(&self, grants: &[ExecutionGrant]) -> Result<(), GatewayError> {
            self.grants.lock().await.extend_from_slice(grants);
            Ok(())
        }
    }

    /// Store whose commits fail while `offline` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStateStore,
        offline: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        fn label(&self) -> &'static str {
            "flaky"
        }

        async fn load(&self) -> Result<Option<EconomySnapshot>, StorageError> {
            self.inner.load().await
        }

        async fn commit(&self, snapshot: &EconomySnapshot) -> Result<(), StorageError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk detached".into()));
            }
            self.inner.commit(snapshot).await
        }
    }

    #[tokio::test]
    async fn winning_bid_burns_and_grants() {
        let economy = economy(EconomyConfig::default()).await;
        let gateway = Arc::new(RecordingGateway::default());
        economy.register_execution_gateway(gateway.clone()).await;
        funded(&economy, "a", 100).await;

        let bid = economy
            .submit_bid(BidRequest::new("a", cpu(1), Credits::from_credits(50)))
            .await
            .unwrap();
        let report = economy.run_cycle().await.unwrap();

        assert_eq!(economy.balance(&"a".into()).await.unwrap(), Credits::from_credits(50));
        assert_eq!(economy.bid(&bid.id).await.unwrap().status, BidStatus::Winning);
        assert_eq!(report.grants.len(), 1);
        assert_eq!(gateway.grants.lock().await.len(), 1);
        let snapshot = economy.market_snapshot().await;
        assert!((snapshot.resources[&ResourceType::Cpu].utilization - 0.1).abs() < 1e-9);
        assert_eq!(snapshot.cycle, 1);
    }

    #[tokio::test]
    async fn outbid_agent_keeps_credits() {
        let mut config = EconomyConfig::default();
        config.market.resources.tokens.available_supply = 100;
        let economy = economy(config).await;
        funded(&economy, "a", 100).await;
        funded(&economy, "b", 100).await;
        let tokens = ResourceBundle::new(1_000).with(ResourceType::Tokens, 100);

        let a = economy
            .submit_bid(BidRequest::new("a", tokens.clone(), Credits::from_credits(30)))
            .await
            .unwrap();
        let b = economy
            .submit_bid(BidRequest::new("b", tokens, Credits::from_credits(50)))
            .await
            .unwrap();
        economy.run_cycle().await.unwrap();

        assert_eq!(economy.bid(&b.id).await.unwrap().status, BidStatus::Winning);
        assert_eq!(economy.bid(&a.id).await.unwrap().status, BidStatus::Rejected);
        assert_eq!(economy.balance(&"b".into()).await.unwrap(), Credits::from_credits(50));
        assert_eq!(economy.balance(&"a".into()).await.unwrap(), Credits::from_credits(100));
    }

    #[tokio::test]
    async fn human_scores_become_credits() {
        let economy = economy(EconomyConfig::default()).await;
        funded(&economy, "a", 100).await;
        economy
            .submit_bid(
                BidRequest::new("a", ResourceBundle::attention(1_000), Credits::from_credits(20))
                    .with_prompt(serde_json::json!({"text": "a poem"})),
            )
            .await
            .unwrap();
        let report = economy.run_cycle().await.unwrap();
        let prompt_id = report.prompts_delivered[0].prompt_id.clone();
        assert_eq!(economy.pending_prompts().await.len(), 1);

        let settlement = economy
            .respond_to_prompt(HumanResponse {
                prompt_id: prompt_id.clone(),
                scores: Scores::new(8, 9, 7),
                reason: None,
            })
            .await
            .unwrap();

        assert_eq!(settlement.scored.reward, Credits::from_credits(1_200));
        assert_eq!(economy.balance(&"a".into()).await.unwrap(), Credits::from_credits(1_280));
        assert!(economy.pending_prompts().await.is_empty());
        assert!(economy.audit().await.is_clean());

        let again = economy
            .respond_to_prompt(HumanResponse {
                prompt_id,
                scores: Scores::new(1, 1, 1),
                reason: None,
            })
            .await;
        assert!(matches!(again, Err(EconomyError::PromptClosed(_))));
    }

    #[tokio::test]
    async fn agent_that_cannot_afford_a_bid_is_pruned() {
        let mut config = EconomyConfig::default();
        config.pruning.min_viable_balance = Credits::from_credits(2);
        let economy = economy(config).await;
        funded(&economy, "a", 1).await;

        let report = economy.run_cycle().await.unwrap();
        assert_eq!(report.pruned, vec![AgentId::new("a")]);
        let agent = economy.agent(&"a".into()).await.unwrap();
        assert!(!agent.is_alive());
        assert!(agent.terminated_at.is_some());

        let err = economy
            .submit_bid(BidRequest::new("a", cpu(1), Credits::from_minor(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::AgentTerminated(_)));
    }

    #[tokio::test]
    async fn failed_commit_changes_nothing() {
        let store = Arc::new(FlakyStore::default());
        let economy = Economy::with_store(EconomyConfig::default(), store.clone())
            .await
            .unwrap();
        funded(&economy, "a", 100).await;
        economy
            .submit_bid(BidRequest::new("a", cpu(1), Credits::from_credits(50)))
            .await
            .unwrap();
        let mut events = economy.subscribe();

        store.offline.store(true, Ordering::SeqCst);
        let err = economy.run_cycle().await.unwrap_err();
        assert!(matches!(err, EconomyError::StructuralFailure(_)));
        assert_eq!(economy.balance(&"a".into()).await.unwrap(), Credits::from_credits(100));
        assert_eq!(economy.current_cycle().await, 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            EconomyEvent::CycleAborted { cycle: 1, .. }
        ));

        let err = economy
            .transfer(&"a".into(), &"a".into(), Credits::from_credits(1), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::InvalidTransfer(_)));

        // The next tick retries from the same Pending bids.
        store.offline.store(false, Ordering::SeqCst);
        let report = economy.run_cycle().await.unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.grants.len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let economy = Economy::with_store(EconomyConfig::default(), store.clone())
            .await
            .unwrap();
        funded(&economy, "a", 100).await;
        let pending = economy
            .submit_bid(BidRequest::new("a", cpu(2), Credits::from_credits(10)))
            .await
            .unwrap();
        economy.run_cycle().await.unwrap();
        economy
            .submit_bid(BidRequest::new("a", cpu(1), Credits::from_credits(5)))
            .await
            .unwrap();

        let restarted = Economy::with_store(EconomyConfig::default(), store)
            .await
            .unwrap();
        assert_eq!(restarted.current_cycle().await, 1);
        assert_eq!(restarted.balance(&"a".into()).await.unwrap(), Credits::from_credits(90));
        assert_eq!(
            restarted.available_balance(&"a".into()).await.unwrap(),
            Credits::from_credits(85)
        );
        assert_eq!(
            restarted.bid(&pending.id).await.unwrap().status,
            BidStatus::Winning
        );
        assert!(restarted.audit().await.is_clean());
    }

    #[tokio::test]
    async fn genesis_is_created_once() {
        let economy = economy(EconomyConfig::default()).await;
        let genesis = economy.ensure_genesis().await.unwrap().unwrap();
        assert_eq!(genesis.id, AgentId::new("genesis"));
        assert_eq!(genesis.balance, Credits::from_credits(1_000));
        assert!(economy.ensure_genesis().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawn_publishes_events() {
        let economy = economy(EconomyConfig::default()).await;
        funded(&economy, "root", 100).await;
        let mut events = economy.subscribe();

        let child = economy
            .spawn_agent(&"root".into(), None, Credits::from_credits(25))
            .await
            .unwrap();
        assert_eq!(child.lineage, vec![AgentId::new("root")]);
        assert_eq!(economy.balance(&"root".into()).await.unwrap(), Credits::from_credits(65));

        assert!(matches!(
            events.recv().await.unwrap(),
            EconomyEvent::CreditsBurned { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            EconomyEvent::AgentSpawned { .. }
        ));
    }

    #[tokio::test]
    async fn cancelled_bid_never_clears() {
        let economy = economy(EconomyConfig::default()).await;
        funded(&economy, "a", 100).await;
        let bid = economy
            .submit_bid(BidRequest::new("a", cpu(1), Credits::from_credits(50)))
            .await
            .unwrap();
        economy.cancel_bid(&bid.id).await.unwrap();

        let report = economy.run_cycle().await.unwrap();
        assert!(report.grants.is_empty());
        assert_eq!(economy.balance(&"a".into()).await.unwrap(), Credits::from_credits(100));
        assert!(matches!(
            economy.cancel_bid(&bid.id).await,
            Err(EconomyError::TooLateToCancel(_))
        ));
    }

    #[tokio::test]
    async fn decided_bid_cannot_be_cancelled() {
        let economy = economy(EconomyConfig::default()).await;
        funded(&economy, "a", 100).await;
        let bid = economy
            .submit_bid(BidRequest::new("a", cpu(10), Credits::from_credits(50)))
            .await
            .unwrap();
        economy.run_cycle().await.unwrap();
        assert!(matches!(
            economy.cancel_bid(&bid.id).await,
            Err(EconomyError::TooLateToCancel(_))
        ));
    }

    #[tokio::test]
    async fn expired_prompt_frees_slot_for_next_cycle() {
        let economy = economy(EconomyConfig::default()).await;
        funded(&economy, "a", 100).await;
        funded(&economy, "b", 100).await;
        for (agent, offer) in [("a", 30), ("b", 20)] {
            economy
                .submit_bid(
                    BidRequest::new(agent, ResourceBundle::attention(1_000), Credits::from_credits(offer))
                        .with_prompt(serde_json::json!(agent)),
                )
                .await
                .unwrap();
        }

        let now = Utc::now();
        let first = economy.run_cycle_at(now).await.unwrap();
        let expired_id: PromptId = first.prompts_delivered[0].prompt_id.clone();

        let later = now + Duration::seconds(301);
        let second = economy.run_cycle_at(later).await.unwrap();
        assert_eq!(second.prompts_expired[0].id, expired_id);
        assert_eq!(second.prompts_delivered[0].agent_id, AgentId::new("b"));
        assert!(second
            .rejected
            .iter()
            .all(|outcome| outcome.rejection != Some(RejectionReason::InsufficientCapacity)));
    }
}
