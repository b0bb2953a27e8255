//! Economy event bus.
//!
//! Events are published only after the state change they describe has been
//! committed. Slow subscribers lag and lose events; publishing never blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentId, BidId, BidStatus, Credits, PromptId, RejectionReason, ResourceType};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EconomyEvent {
    AgentRegistered {
        agent_id: AgentId,
        endowment: Credits,
    },
    AgentSpawned {
        parent_id: AgentId,
        child_id: AgentId,
        initial_credits: Credits,
        spawn_cost: Credits,
    },
    CreditsTransferred {
        from: AgentId,
        to: AgentId,
        amount: Credits,
        memo: String,
    },
    CreditsBurned {
        agent_id: AgentId,
        amount: Credits,
        memo: String,
    },
    BidPlaced {
        bid_id: BidId,
        agent_id: AgentId,
        total_cost: Credits,
    },
    BidCancelled {
        bid_id: BidId,
        agent_id: AgentId,
    },
    BidProcessed {
        bid_id: BidId,
        agent_id: AgentId,
        status: BidStatus,
        rejection: Option<RejectionReason>,
        cycle: u64,
    },
    ExecutionGranted {
        bid_id: BidId,
        agent_id: AgentId,
        cost: Credits,
        cycle: u64,
    },
    PromptDelivered {
        prompt_id: PromptId,
        agent_id: AgentId,
        respond_by: DateTime<Utc>,
    },
    PromptExpired {
        prompt_id: PromptId,
        agent_id: AgentId,
    },
    AttentionRewarded {
        prompt_id: PromptId,
        agent_id: AgentId,
        reward: Credits,
    },
    PriceDiscovered {
        resource: ResourceType,
        previous_price: Credits,
        new_price: Credits,
        utilization: f64,
        cycle: u64,
    },
    AgentTerminated {
        agent_id: AgentId,
        cycle: u64,
    },
    CycleAborted {
        cycle: u64,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EconomyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EconomyEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EconomyEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EconomyEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
