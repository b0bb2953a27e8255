//! Gateway adapters for the syntropism economy.

#![deny(unsafe_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use syntropism_core::{
    ExecutionGateway, ExecutionGrant, GatewayError, PromptDelivery, PromptGateway, PromptId,
};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

/// Logs every grant and does nothing else. Useful for local runs without a
/// real execution runner.
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutionGateway;

#[async_trait]
impl ExecutionGateway for LoggingExecutionGateway {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn dispatch(&self, grants: &[ExecutionGrant]) -> Result<(), GatewayError> {
        for grant in grants {
            info!(
                grant_id = %grant.grant_id,
                agent_id = %grant.agent_id,
                cost = %grant.cost,
                cycle = grant.cycle,
                duration_ms = grant.bundle.duration_ms,
                "Execution granted"
            );
        }
        Ok(())
    }
}

/// Forwards grants to an in-process runner over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelExecutionGateway {
    sender: mpsc::Sender<ExecutionGrant>,
}

impl ChannelExecutionGateway {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionGrant>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ExecutionGateway for ChannelExecutionGateway {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn dispatch(&self, grants: &[ExecutionGrant]) -> Result<(), GatewayError> {
        for grant in grants {
            self.sender
                .send(grant.clone())
                .await
                .map_err(|_| GatewayError::Unavailable("execution runner went away".into()))?;
        }
        Ok(())
    }
}

/// Deterministic failing gateway for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailGateway {
    reason: String,
}

impl AlwaysFailGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ExecutionGateway for AlwaysFailGateway {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn dispatch(&self, _grants: &[ExecutionGrant]) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable(self.reason.clone()))
    }
}

#[async_trait]
impl PromptGateway for AlwaysFailGateway {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn deliver(&self, _delivery: &PromptDelivery) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable(self.reason.clone()))
    }

    async fn withdraw(&self, _prompt_id: &PromptId) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable(self.reason.clone()))
    }
}

/// In-memory inbox of prompts awaiting a human answer.
///
/// The service reads it to show the human what is waiting; the engine removes
/// entries once they are answered or expire.
#[derive(Debug, Default)]
pub struct PromptInbox {
    prompts: Mutex<BTreeMap<PromptId, PromptDelivery>>,
}

impl PromptInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiting prompts, oldest delivery first.
    pub async fn list(&self) -> Vec<PromptDelivery> {
        let mut waiting: Vec<PromptDelivery> = self.prompts.lock().await.values().cloned().collect();
        waiting.sort_by(|a, b| {
            a.delivered_at
                .cmp(&b.delivered_at)
                .then_with(|| a.prompt_id.cmp(&b.prompt_id))
        });
        waiting
    }

    pub async fn get(&self, prompt_id: &PromptId) -> Option<PromptDelivery> {
        self.prompts.lock().await.get(prompt_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.prompts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.prompts.lock().await.is_empty()
    }
}

#[async_trait]
impl PromptGateway for PromptInbox {
    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn deliver(&self, delivery: &PromptDelivery) -> Result<(), GatewayError> {
        let mut prompts = self.prompts.lock().await;
        if prompts.contains_key(&delivery.prompt_id) {
            return Err(GatewayError::Rejected(format!(
                "prompt {} already delivered",
                delivery.prompt_id
            )));
        }
        info!(
            prompt_id = %delivery.prompt_id,
            agent_id = %delivery.agent_id,
            respond_by = %delivery.respond_by,
            "Prompt waiting for a human"
        );
        prompts.insert(delivery.prompt_id.clone(), delivery.clone());
        Ok(())
    }

    async fn withdraw(&self, prompt_id: &PromptId) -> Result<(), GatewayError> {
        self.prompts.lock().await.remove(prompt_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use syntropism_core::{AgentId, BidId, Credits, GrantId, ResourceBundle, ResourceType};

    fn sample_grant(id: &str) -> ExecutionGrant {
        ExecutionGrant {
            grant_id: GrantId::new(id),
            bid_id: BidId::new(format!("bid-{id}")),
            agent_id: AgentId::new("agent-a"),
            bundle: ResourceBundle::new(1_000).with(ResourceType::Cpu, 2),
            cost: Credits::from_credits(5),
            cycle: 1,
            granted_at: Utc::now(),
        }
    }

    fn sample_delivery(id: &str, offset_secs: i64) -> PromptDelivery {
        let delivered_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + Duration::seconds(offset_secs);
        PromptDelivery {
            prompt_id: PromptId::new(id),
            bid_id: BidId::new(format!("bid-{id}")),
            agent_id: AgentId::new("agent-a"),
            payload: serde_json::json!({ "text": "look at this" }),
            delivered_at,
            respond_by: delivered_at + Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn logging_gateway_accepts_everything() {
        let gateway = LoggingExecutionGateway;
        gateway
            .dispatch(&[sample_grant("g-1"), sample_grant("g-2")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn channel_gateway_forwards_grants_in_order() {
        let (gateway, mut receiver) = ChannelExecutionGateway::new(4);
        gateway
            .dispatch(&[sample_grant("g-1"), sample_grant("g-2")])
            .await
            .unwrap();

        assert_eq!(receiver.recv().await.unwrap().grant_id.as_str(), "g-1");
        assert_eq!(receiver.recv().await.unwrap().grant_id.as_str(), "g-2");
    }

    #[tokio::test]
    async fn channel_gateway_reports_a_closed_runner() {
        let (gateway, receiver) = ChannelExecutionGateway::new(1);
        drop(receiver);
        let err = gateway.dispatch(&[sample_grant("g-1")]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn failing_gateway_returns_error() {
        let gateway = AlwaysFailGateway::new("forced");
        let err = gateway.dispatch(&[sample_grant("g-1")]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        let err = gateway
            .deliver(&sample_delivery("p-1", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn inbox_lists_oldest_first_and_forgets_withdrawn() {
        let inbox = PromptInbox::new();
        inbox.deliver(&sample_delivery("p-late", 30)).await.unwrap();
        inbox.deliver(&sample_delivery("p-early", 0)).await.unwrap();

        let listed: Vec<String> = inbox
            .list()
            .await
            .into_iter()
            .map(|delivery| delivery.prompt_id.to_string())
            .collect();
        assert_eq!(listed, vec!["p-early", "p-late"]);

        inbox.withdraw(&PromptId::new("p-early")).await.unwrap();
        assert_eq!(inbox.len().await, 1);
        assert!(inbox.get(&PromptId::new("p-early")).await.is_none());

        // Withdrawing twice is harmless.
        inbox.withdraw(&PromptId::new("p-early")).await.unwrap();
        assert_eq!(inbox.len().await, 1);
    }

    #[tokio::test]
    async fn inbox_rejects_duplicate_delivery() {
        let inbox = PromptInbox::new();
        inbox.deliver(&sample_delivery("p-1", 0)).await.unwrap();
        let err = inbox.deliver(&sample_delivery("p-1", 0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
