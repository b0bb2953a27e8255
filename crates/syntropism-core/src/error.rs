use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::types::{AgentId, BidId, Credits, PromptId};

/// Economy errors.
///
/// User errors (`InsufficientFunds`, `InvalidBundle`, `TooLateToCancel`, ...)
/// are local to one request and returned synchronously. `StructuralFailure`
/// aborts the current cycle only. `ConcurrentBalanceChange` never leaves the
/// clearer: it demotes a bid to `Rejected`.
#[derive(Debug, Error)]
pub enum EconomyError {
    #[error("insufficient funds for agent {agent}: requested {requested}, available {available}")]
    InsufficientFunds {
        agent: AgentId,
        requested: Credits,
        available: Credits,
    },

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("offer {offered} is below the current market quote {quote}")]
    BelowReservePrice { offered: Credits, quote: Credits },

    #[error("bid {0} can no longer be cancelled")]
    TooLateToCancel(BidId),

    #[error("balance of agent {agent} changed before settlement of bid {bid}")]
    ConcurrentBalanceChange { agent: AgentId, bid: BidId },

    #[error("structural failure: {0}")]
    StructuralFailure(String),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("agent already exists: {0}")]
    AgentExists(AgentId),

    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("agent {0} is terminated")]
    AgentTerminated(AgentId),

    #[error("bid not found: {0}")]
    BidNotFound(BidId),

    #[error("prompt not found: {0}")]
    PromptNotFound(PromptId),

    #[error("prompt {0} is closed")]
    PromptClosed(PromptId),

    #[error("scores must be between 0 and 10")]
    InvalidScores,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EconomyError {
    /// True for errors caused by the caller's request rather than by the engine.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::StructuralFailure(_) | Self::InvariantViolation(_) | Self::Config(_)
        )
    }

    pub fn phase_violation(expected: &str, actual: &str) -> Self {
        Self::InvariantViolation(format!(
            "clearing phase order violation: expected '{}', got '{}'",
            expected, actual
        ))
    }

    pub fn overflow(context: &str) -> Self {
        Self::InvariantViolation(format!("credit overflow in {}", context))
    }
}

impl From<StorageError> for EconomyError {
    fn from(err: StorageError) -> Self {
        Self::StructuralFailure(err.to_string())
    }
}
