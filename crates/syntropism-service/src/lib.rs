#![deny(unsafe_code)]

pub mod ticker;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use syntropism_adapters::{LoggingExecutionGateway, PromptInbox};
use syntropism_core::{
    Agent, AgentId, Bid, BidId, BidRequest, Credits, CycleReport, Economy, EconomyConfig,
    EconomyError, HumanResponse, LedgerAudit, MarketSnapshot, PromptDelivery, PromptGateway,
    PromptId, Scores, StorageConfig, Transaction,
};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1_000);
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_TICK_INTERVAL: Duration = Duration::from_millis(10_000);

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 1_000;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub economy: EconomyConfig,
    pub tick_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            economy: EconomyConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl ServiceConfig {
    /// Read an economy configuration from a JSON file. Missing sections fall
    /// back to their defaults.
    pub fn from_file(path: &FsPath) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ServiceError::ConfigFile {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let economy: EconomyConfig =
            serde_json::from_str(&raw).map_err(|err| ServiceError::ConfigFile {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(Self {
            economy,
            ..Self::default()
        })
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL);
        self
    }

    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.economy.storage = StorageConfig::json_file(path);
        self
    }

    pub fn with_genesis_credits(mut self, credits: Credits) -> Self {
        self.economy.spawn.genesis_endowment = credits;
        self
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub economy: Arc<Economy>,
    pub inbox: Arc<PromptInbox>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let economy = Economy::bootstrap(config.economy).await?;
        let inbox = Arc::new(PromptInbox::new());

        // A recovered slot may already hold a prompt the human has not seen.
        for delivery in economy.pending_prompts().await {
            inbox
                .deliver(&delivery)
                .await
                .map_err(|err| ServiceError::Bootstrap(err.to_string()))?;
        }
        economy
            .register_execution_gateway(Arc::new(LoggingExecutionGateway))
            .await;
        economy.register_prompt_gateway(inbox.clone()).await;

        if let Some(genesis) = economy.ensure_genesis().await? {
            info!(agent = %genesis.id, endowment = %genesis.balance, "Genesis agent created");
        }

        Ok(Self {
            economy: Arc::new(economy),
            inbox,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/agents", post(register_agent))
        .route("/v1/agents/:id", get(get_agent))
        .route("/v1/agents/:id/spawn", post(spawn_agent))
        .route("/v1/agents/:id/transactions", get(list_transactions))
        .route("/v1/agents/:id/bids", get(list_agent_bids))
        .route("/v1/transfers", post(transfer))
        .route("/v1/bids", post(submit_bid))
        .route("/v1/bids/:id", get(get_bid))
        .route("/v1/bids/:id/cancel", post(cancel_bid))
        .route("/v1/market", get(market))
        .route("/v1/prompts/pending", get(pending_prompts))
        .route("/v1/prompts/:id/response", post(respond_to_prompt))
        .route("/v1/cycles", post(run_cycle))
        .route("/v1/audit", get(audit))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("economy error: {0}")]
    Economy(#[from] EconomyError),
    #[error("failed to read config file {}: {message}", path.display())]
    ConfigFile { path: PathBuf, message: String },
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Economy(#[from] EconomyError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn economy_status(err: &EconomyError) -> StatusCode {
    match err {
        EconomyError::AgentNotFound(_)
        | EconomyError::BidNotFound(_)
        | EconomyError::PromptNotFound(_) => StatusCode::NOT_FOUND,
        EconomyError::AgentExists(_)
        | EconomyError::AgentTerminated(_)
        | EconomyError::TooLateToCancel(_)
        | EconomyError::PromptClosed(_)
        | EconomyError::ConcurrentBalanceChange { .. } => StatusCode::CONFLICT,
        EconomyError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        err if err.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Economy(err) => (
                economy_status(&err),
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    cycle: u64,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "syntropism-service",
        storage_backend: state.economy.storage_label(),
        cycle: state.economy.current_cycle().await,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterAgentRequest {
    id: Option<String>,
    /// Minor units.
    endowment: Credits,
}

#[derive(Debug, Clone, Serialize)]
struct AgentView {
    #[serde(flatten)]
    agent: Agent,
    available: Credits,
}

async fn agent_view(state: &ServiceState, agent: Agent) -> Result<AgentView, ApiError> {
    let available = state.economy.available_balance(&agent.id).await?;
    Ok(AgentView { agent, available })
}

async fn register_agent(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<AgentView>), ApiError> {
    let agent = state
        .economy
        .register_agent(request.id.map(AgentId::new), request.endowment)
        .await?;
    Ok((StatusCode::CREATED, Json(agent_view(&state, agent).await?)))
}

async fn get_agent(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AgentView>, ApiError> {
    let agent = state.economy.agent(&AgentId::new(id)).await?;
    Ok(Json(agent_view(&state, agent).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct SpawnRequest {
    child_id: Option<String>,
    initial_credits: Credits,
}

async fn spawn_agent(
    Path(parent): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<SpawnRequest>,
) -> Result<(StatusCode, Json<AgentView>), ApiError> {
    let child = state
        .economy
        .spawn_agent(
            &AgentId::new(parent),
            request.child_id.map(AgentId::new),
            request.initial_credits,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(agent_view(&state, child).await?)))
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> Result<usize, ApiError> {
        match self.limit {
            None => Ok(DEFAULT_PAGE),
            Some(0) => Err(ApiError::bad_request("limit must be positive")),
            Some(limit) => Ok(limit.min(MAX_PAGE)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ItemsResponse<T> {
    returned: usize,
    items: Vec<T>,
}

impl<T> From<Vec<T>> for ItemsResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            returned: items.len(),
            items,
        }
    }
}

async fn list_transactions(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ItemsResponse<Transaction>>, ApiError> {
    let limit = query.limit()?;
    let items = state.economy.history(&AgentId::new(id), limit).await?;
    Ok(Json(items.into()))
}

async fn list_agent_bids(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ItemsResponse<Bid>>, ApiError> {
    let limit = query.limit()?;
    let items = state.economy.bid_history(&AgentId::new(id), limit).await?;
    Ok(Json(items.into()))
}

#[derive(Debug, Clone, Deserialize)]
struct TransferRequest {
    from: String,
    to: String,
    amount: Credits,
    #[serde(default)]
    memo: Option<String>,
}

async fn transfer(
    State(state): State<ServiceState>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let memo = request.memo.unwrap_or_else(|| "transfer".to_string());
    let tx = state
        .economy
        .transfer(
            &AgentId::new(request.from),
            &AgentId::new(request.to),
            request.amount,
            &memo,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn submit_bid(
    State(state): State<ServiceState>,
    Json(request): Json<BidRequest>,
) -> Result<(StatusCode, Json<Bid>), ApiError> {
    let bid = state.economy.submit_bid(request).await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

async fn get_bid(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Bid>, ApiError> {
    Ok(Json(state.economy.bid(&BidId::new(id)).await?))
}

async fn cancel_bid(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Bid>, ApiError> {
    Ok(Json(state.economy.cancel_bid(&BidId::new(id)).await?))
}

async fn market(State(state): State<ServiceState>) -> Json<MarketSnapshot> {
    Json(state.economy.market_snapshot().await)
}

async fn pending_prompts(
    State(state): State<ServiceState>,
) -> Json<ItemsResponse<PromptDelivery>> {
    Json(state.inbox.list().await.into())
}

#[derive(Debug, Clone, Deserialize)]
struct PromptResponseRequest {
    scores: Scores,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PromptResponseOutcome {
    prompt_id: PromptId,
    agent_id: AgentId,
    reward: Credits,
    transaction_id: Option<String>,
    responded_at: DateTime<Utc>,
}

async fn respond_to_prompt(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<PromptResponseRequest>,
) -> Result<Json<PromptResponseOutcome>, ApiError> {
    let settlement = state
        .economy
        .respond_to_prompt(HumanResponse {
            prompt_id: PromptId::new(id),
            scores: request.scores,
            reason: request.reason,
        })
        .await?;
    Ok(Json(PromptResponseOutcome {
        prompt_id: settlement.scored.prompt_id,
        agent_id: settlement.scored.agent_id,
        reward: settlement.scored.reward,
        transaction_id: settlement.transaction.map(|tx| tx.id),
        responded_at: Utc::now(),
    }))
}

async fn run_cycle(State(state): State<ServiceState>) -> Result<Json<CycleReport>, ApiError> {
    Ok(Json(state.economy.run_cycle().await?))
}

async fn audit(State(state): State<ServiceState>) -> Json<LedgerAudit> {
    Json(state.economy.audit().await)
}
