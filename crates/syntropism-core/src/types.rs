use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque agent identifier.
    AgentId
);
string_id!(
    /// Bid identifier.
    BidId
);
string_id!(
    /// Identifier of a prompt delivered through the attention slot.
    PromptId
);
string_id!(
    /// Identifier of an execution grant.
    GrantId
);

/// Fixed-point credit amount in minor units (1 credit = 1 000 minor units).
///
/// Credits never go negative and all arithmetic is checked, so rounding drift
/// cannot break conservation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(u64);

impl Credits {
    pub const MINOR_PER_CREDIT: u64 = 1_000;
    pub const ZERO: Credits = Credits(0);

    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Whole credits. Saturates at `u64::MAX` minor units.
    pub const fn from_credits(credits: u64) -> Self {
        Self(credits.saturating_mul(Self::MINOR_PER_CREDIT))
    }

    pub const fn minor(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul(self, factor: u64) -> Option<Credits> {
        self.0.checked_mul(factor).map(Credits)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03}",
            self.0 / Self::MINOR_PER_CREDIT,
            self.0 % Self::MINOR_PER_CREDIT
        )
    }
}

/// Closed set of priced resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Tokens,
    Attention,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Tokens,
        ResourceType::Attention,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Tokens => "tokens",
            Self::Attention => "attention",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per resource type. Every access is an exhaustive match, so adding
/// a resource is a compile error everywhere it matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerResource<T> {
    pub cpu: T,
    pub memory: T,
    pub tokens: T,
    pub attention: T,
}

impl<T> PerResource<T> {
    pub fn from_fn(mut f: impl FnMut(ResourceType) -> T) -> Self {
        Self {
            cpu: f(ResourceType::Cpu),
            memory: f(ResourceType::Memory),
            tokens: f(ResourceType::Tokens),
            attention: f(ResourceType::Attention),
        }
    }

    pub fn get(&self, resource: ResourceType) -> &T {
        match resource {
            ResourceType::Cpu => &self.cpu,
            ResourceType::Memory => &self.memory,
            ResourceType::Tokens => &self.tokens,
            ResourceType::Attention => &self.attention,
        }
    }

    pub fn get_mut(&mut self, resource: ResourceType) -> &mut T {
        match resource {
            ResourceType::Cpu => &mut self.cpu,
            ResourceType::Memory => &mut self.memory,
            ResourceType::Tokens => &mut self.tokens,
            ResourceType::Attention => &mut self.attention,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &T)> {
        ResourceType::ALL.into_iter().map(move |r| (r, self.get(r)))
    }
}

/// Requested amount per resource, in that resource's native unit.
pub type ResourceAmounts = PerResource<u64>;

impl ResourceAmounts {
    pub fn with(mut self, resource: ResourceType, amount: u64) -> Self {
        *self.get_mut(resource) = amount;
        self
    }

    /// Resources with a non-zero request.
    pub fn named(&self) -> impl Iterator<Item = (ResourceType, u64)> + '_ {
        self.iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|(resource, amount)| (resource, *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.named().next().is_none()
    }
}

/// Everything one execution needs, held simultaneously for `duration_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub amounts: ResourceAmounts,
    pub duration_ms: u64,
}

impl ResourceBundle {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            amounts: ResourceAmounts::default(),
            duration_ms,
        }
    }

    pub fn with(mut self, resource: ResourceType, amount: u64) -> Self {
        self.amounts = self.amounts.with(resource, amount);
        self
    }

    /// A single attention unit held for `duration_ms`.
    pub fn attention(duration_ms: u64) -> Self {
        Self::new(duration_ms).with(ResourceType::Attention, 1)
    }

    pub fn amount(&self, resource: ResourceType) -> u64 {
        *self.amounts.get(resource)
    }

    pub fn scope(&self) -> BidScope {
        if self.amount(ResourceType::Attention) > 0 {
            BidScope::Attention
        } else {
            BidScope::Execution
        }
    }
}

/// Which pending queue a bid competes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidScope {
    Execution,
    Attention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Alive,
    Dead,
}

/// Agent record. Never physically deleted; `Dead` agents stay for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub balance: Credits,
    pub status: AgentStatus,
    pub initial_endowment: Credits,
    pub total_earned: Credits,
    pub total_spent: Credits,
    pub execution_count: u64,
    /// Ancestors, nearest first. Ids only.
    pub lineage: Vec<AgentId>,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: AgentId, endowment: Credits, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            balance: endowment,
            status: AgentStatus::Alive,
            initial_endowment: endowment,
            total_earned: Credits::ZERO,
            total_spent: Credits::ZERO,
            execution_count: 0,
            lineage: Vec::new(),
            created_at,
            last_execution: None,
            terminated_at: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == AgentStatus::Alive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Winning,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InsufficientCapacity,
    BelowReservePrice,
    ConcurrentBalanceChange,
    AgentTerminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub agent_id: AgentId,
    pub bundle: ResourceBundle,
    pub total_cost: Credits,
    /// Market quote for the bundle when the bid was accepted.
    pub quoted_at_submission: Credits,
    pub status: BidStatus,
    pub submitted_at: DateTime<Utc>,
    /// Monotonic arrival order; last tie-breaker after `submitted_at`.
    pub sequence: u64,
    pub prompt: Option<serde_json::Value>,
    pub rejection: Option<RejectionReason>,
    pub decided_in_cycle: Option<u64>,
}

impl Bid {
    pub fn scope(&self) -> BidScope {
        self.bundle.scope()
    }

    pub fn is_pending(&self) -> bool {
        self.status == BidStatus::Pending
    }
}

/// Incoming bid submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRequest {
    pub agent_id: AgentId,
    pub bundle: ResourceBundle,
    pub offered_total: Credits,
    #[serde(default)]
    pub prompt: Option<serde_json::Value>,
}

impl BidRequest {
    pub fn new(agent_id: impl Into<AgentId>, bundle: ResourceBundle, offered_total: Credits) -> Self {
        Self {
            agent_id: agent_id.into(),
            bundle,
            offered_total,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: serde_json::Value) -> Self {
        self.prompt = Some(prompt);
        self
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Authorization for the external runner to execute a winning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGrant {
    pub grant_id: GrantId,
    pub bid_id: BidId,
    pub agent_id: AgentId,
    pub bundle: ResourceBundle,
    pub cost: Credits,
    pub cycle: u64,
    pub granted_at: DateTime<Utc>,
}

/// Human scores, each bounded to `0..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub interesting: u8,
    pub useful: u8,
    pub understandable: u8,
}

impl Scores {
    pub const MAX: u8 = 10;

    pub fn new(interesting: u8, useful: u8, understandable: u8) -> Self {
        Self {
            interesting,
            useful,
            understandable,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.interesting <= Self::MAX
            && self.useful <= Self::MAX
            && self.understandable <= Self::MAX
    }
}

/// Human response to a delivered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub prompt_id: PromptId,
    pub scores: Scores,
    #[serde(default)]
    pub reason: Option<String>,
}
