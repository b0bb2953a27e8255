//! Seams to the collaborators outside the core: the execution runner and the
//! human-facing prompt surface.

use async_trait::async_trait;
use thiserror::Error;

use crate::attention::PromptDelivery;
use crate::types::{ExecutionGrant, PromptId};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected delivery: {0}")]
    Rejected(String),
}

/// Receives the execution grants of each committed cycle.
///
/// Grants are irrevocable once committed; a dispatch failure is logged by the
/// engine and never undoes the cycle.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, grants: &[ExecutionGrant]) -> Result<(), GatewayError>;
}

/// Receives prompt deliveries and withdrawals for the human-facing surface.
#[async_trait]
pub trait PromptGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, delivery: &PromptDelivery) -> Result<(), GatewayError>;

    /// The prompt was answered or expired and should no longer be shown.
    async fn withdraw(&self, prompt_id: &PromptId) -> Result<(), GatewayError>;
}

/// Drops everything. Used until a real gateway is registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGateway;

#[async_trait]
impl ExecutionGateway for NoopGateway {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn dispatch(&self, _grants: &[ExecutionGrant]) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[async_trait]
impl PromptGateway for NoopGateway {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn deliver(&self, _delivery: &PromptDelivery) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn withdraw(&self, _prompt_id: &PromptId) -> Result<(), GatewayError> {
        Ok(())
    }
}
