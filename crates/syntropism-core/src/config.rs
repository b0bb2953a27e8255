//! Configuration for the economy engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Credits, PerResource, ResourceType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{resource}: {message}")]
    Market {
        resource: ResourceType,
        message: String,
    },
    #[error("utilization thresholds must satisfy 0 <= low < high <= 1 (low={low}, high={high})")]
    Thresholds { low: String, high: String },
    #[error("attention: {0}")]
    Attention(String),
    #[error("attention supply must be exactly 1, got {0}")]
    AttentionSupply(u64),
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub market: MarketConfig,
    pub clearing: ClearingConfig,
    pub attention: AttentionConfig,
    pub pruning: PruningConfig,
    pub spawn: SpawnConfig,
    pub invariants: InvariantConfig,
    pub storage: StorageConfig,
}

impl EconomyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.market.validate()?;
        self.attention.validate()
    }
}

/// How prices react to a clearing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingPolicy {
    /// Bounded multiplicative steps when utilization crosses the thresholds.
    Threshold,
    /// Price follows what winners actually paid per capacity-second.
    MarginalClearing,
}

/// Per-resource market parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMarketConfig {
    /// Capacity per clearing window.
    pub available_supply: u64,
    /// Credits per unit per second.
    pub initial_price: Credits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub resources: PerResource<ResourceMarketConfig>,
    pub pricing: PricingPolicy,
    pub high_utilization: f64,
    pub low_utilization: f64,
    /// Multiplicative increase in basis points (1000 = 10%).
    pub increase_bps: u32,
    /// Multiplicative decrease in basis points (500 = 5%).
    pub decrease_bps: u32,
    pub min_price: Credits,
    pub max_price: Credits,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            resources: PerResource {
                cpu: ResourceMarketConfig {
                    available_supply: 10,
                    initial_price: Credits::from_credits(1),
                },
                memory: ResourceMarketConfig {
                    available_supply: 16_384,
                    initial_price: Credits::from_minor(1),
                },
                tokens: ResourceMarketConfig {
                    available_supply: 100_000,
                    initial_price: Credits::from_minor(1),
                },
                attention: ResourceMarketConfig {
                    available_supply: 1,
                    initial_price: Credits::from_credits(10),
                },
            },
            pricing: PricingPolicy::Threshold,
            high_utilization: 0.8,
            low_utilization: 0.2,
            increase_bps: 1_000,
            decrease_bps: 500,
            min_price: Credits::from_minor(1),
            max_price: Credits::from_credits(1_000),
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.low_utilization)
            || !(0.0..=1.0).contains(&self.high_utilization)
            || self.low_utilization >= self.high_utilization
        {
            return Err(ConfigError::Thresholds {
                low: self.low_utilization.to_string(),
                high: self.high_utilization.to_string(),
            });
        }

        for (resource, cfg) in self.resources.iter() {
            let market_err = |message: String| ConfigError::Market { resource, message };
            if cfg.available_supply == 0 {
                return Err(market_err("available_supply must be positive".into()));
            }
            if self.min_price.is_zero() {
                return Err(market_err("min_price must be positive to stay quotable".into()));
            }
            if self.min_price > self.max_price {
                return Err(market_err(format!(
                    "min_price {} exceeds max_price {}",
                    self.min_price, self.max_price
                )));
            }
            if cfg.initial_price < self.min_price || cfg.initial_price > self.max_price {
                return Err(market_err(format!(
                    "initial_price {} outside [{}, {}]",
                    cfg.initial_price, self.min_price, self.max_price
                )));
            }
        }

        if self.resources.attention.available_supply != 1 {
            return Err(ConfigError::AttentionSupply(
                self.resources.attention.available_supply,
            ));
        }
        if self.decrease_bps >= 10_000 {
            return Err(ConfigError::Market {
                resource: ResourceType::Cpu,
                message: "decrease_bps must be below 10000".into(),
            });
        }
        Ok(())
    }
}

/// What happens to capacity freed by a failed settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementFailurePolicy {
    /// Freed capacity stays unused until the next cycle.
    Forfeit,
    /// One bounded second pass offers freed capacity to bids rejected for capacity.
    ReofferOnce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearingConfig {
    pub tick_interval_ms: u64,
    pub settlement_failure: SettlementFailurePolicy,
    /// Require offers to cover the bundle's market quote.
    pub enforce_reserve_price: bool,
}

impl ClearingConfig {
    pub const MIN_TICK_MS: u64 = 100;
    pub const MAX_TICK_MS: u64 = 10_000;

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.tick_interval_ms
                .clamp(Self::MIN_TICK_MS, Self::MAX_TICK_MS),
        )
    }
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            settlement_failure: SettlementFailurePolicy::Forfeit,
            enforce_reserve_price: true,
        }
    }
}

/// Credits awarded per score point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub interesting: Credits,
    pub useful: Credits,
    pub understandable: Credits,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            interesting: Credits::from_credits(50),
            useful: Credits::from_credits(50),
            understandable: Credits::from_credits(50),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub weights: ScoreWeights,
    pub response_timeout_ms: u64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            response_timeout_ms: 300_000,
        }
    }
}

impl AttentionConfig {
    pub const MAX_RESPONSE_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Attention(
                "response_timeout_ms must be positive".into(),
            ));
        }
        if self.response_timeout_ms > Self::MAX_RESPONSE_TIMEOUT_MS {
            return Err(ConfigError::Attention(format!(
                "response_timeout_ms must not exceed {}",
                Self::MAX_RESPONSE_TIMEOUT_MS
            )));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> chrono::Duration {
        let millis = self.response_timeout_ms.min(Self::MAX_RESPONSE_TIMEOUT_MS);
        chrono::Duration::milliseconds(millis as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Agents below this balance with nothing pending are terminated.
    /// One minor unit means "balance == 0".
    pub min_viable_balance: Credits,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            min_viable_balance: Credits::from_minor(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    pub spawn_cost: Credits,
    pub genesis_agent: String,
    pub genesis_endowment: Credits,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            spawn_cost: Credits::from_credits(10),
            genesis_agent: "genesis".to_string(),
            genesis_endowment: Credits::from_credits(1_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvariantConfig {
    /// Panic on a conservation violation instead of aborting the cycle.
    pub strict: bool,
}

impl Default for InvariantConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// State persistence backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep all state in process memory only.
    #[default]
    Memory,
    /// Commit a full snapshot to a JSON file on every mutation.
    JsonFile { path: PathBuf },
}

impl StorageConfig {
    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self::JsonFile { path: path.into() }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::JsonFile { .. } => "json_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EconomyConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = EconomyConfig::default();
        config.market.low_utilization = 0.9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Thresholds { .. })
        ));
    }

    #[test]
    fn rejects_zero_supply() {
        let mut config = EconomyConfig::default();
        config.market.resources.cpu.available_supply = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Market {
                resource: ResourceType::Cpu,
                ..
            })
        ));
    }

    #[test]
    fn attention_supply_is_fixed_at_one() {
        let mut config = EconomyConfig::default();
        config.market.resources.attention.available_supply = 2;
        assert_eq!(config.validate(), Err(ConfigError::AttentionSupply(2)));
    }

    #[test]
    fn tick_interval_is_clamped() {
        let clearing = ClearingConfig {
            tick_interval_ms: 5,
            ..ClearingConfig::default()
        };
        assert_eq!(clearing.tick_interval().as_millis(), 100);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EconomyConfig = serde_json::from_value(serde_json::json!({
            "clearing": { "settlement_failure": "reoffer_once" },
            "storage": { "backend": "json_file", "path": "/tmp/state.json" }
        }))
        .unwrap();
        assert_eq!(
            config.clearing.settlement_failure,
            SettlementFailurePolicy::ReofferOnce
        );
        assert_eq!(config.clearing.tick_interval_ms, 1_000);
        assert_eq!(config.storage.label(), "json_file");
    }
}
