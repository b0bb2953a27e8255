//! Syntropism core: a resource economy for autonomous agents.
//!
//! Agents hold credits in an append-only, hash-chained ledger and bid for
//! bundles of scarce resources. A periodic clearing cycle sorts bids, grants
//! whole bundles to the highest offers that fit, burns what winners pay,
//! reprices each resource from its utilization and prunes agents that can no
//! longer take part. A single attention slot lets agents buy a human's focus
//! and earn credits back from the human's scores.

#![deny(unsafe_code)]

pub mod attention;
pub mod auction;
pub mod book;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod market;
pub mod pruner;
pub mod state;
pub mod storage;
pub mod types;

pub use attention::{
    score_to_credits, AttentionSlot, Prompt, PromptDelivery, PromptStatus, ScoredPrompt,
};
pub use auction::{
    allocate, sort_bids, Allocation, AuctionClearer, BidOutcome, ClearingMachine, ClearingPhase,
    CycleReport,
};
pub use book::BidBook;
pub use config::{
    AttentionConfig, ClearingConfig, ConfigError, EconomyConfig, InvariantConfig, MarketConfig,
    PricingPolicy, PruningConfig, ResourceMarketConfig, ScoreWeights, SettlementFailurePolicy,
    SpawnConfig, StorageConfig,
};
pub use engine::Economy;
pub use error::EconomyError;
pub use events::{EconomyEvent, EventBus};
pub use gateway::{ExecutionGateway, GatewayError, NoopGateway, PromptGateway};
pub use ledger::{
    Account, ConservationReport, Ledger, LedgerAudit, Reservation, SupplyTotals, Transaction,
    TransactionLog,
};
pub use market::{Market, MarketSnapshot, MarketState, PriceUpdate, ResourceQuote};
pub use pruner::Pruner;
pub use state::{validate_bundle, AttentionSettlement, EconomyState, Spawned};
pub use storage::{
    build_store, EconomySnapshot, JsonFileStateStore, MemoryStateStore, StateStore, StorageError,
};
pub use types::{
    Agent, AgentId, AgentStatus, Bid, BidId, BidRequest, BidScope, BidStatus, Credits,
    ExecutionGrant, GrantId, HumanResponse, PerResource, PromptId, RejectionReason,
    ResourceAmounts, ResourceBundle, ResourceType, Scores,
};
