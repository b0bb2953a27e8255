//! Multi-resource market: supply, utilization and price per resource type.
//!
//! Prices only move inside a clearing cycle and are piecewise-constant between
//! cycles. Each resource's state is a versioned record owned by the market;
//! readers get copies through `snapshot`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{MarketConfig, PricingPolicy};
use crate::error::EconomyError;
use crate::types::{Credits, PerResource, ResourceBundle, ResourceType};

const BPS: u128 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub resource: ResourceType,
    pub available_supply: u64,
    /// Fraction of supply allocated in the last cycle, 0..=1.
    pub utilization: f64,
    /// Credits per unit per second.
    pub current_price: Credits,
    pub last_allocated: u64,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of one price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub resource: ResourceType,
    pub previous_price: Credits,
    pub new_price: Credits,
    pub utilization: f64,
    pub version: u64,
}

impl PriceUpdate {
    pub fn changed(&self) -> bool {
        self.previous_price != self.new_price
    }
}

/// Point-in-time view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuote {
    pub price: Credits,
    pub utilization: f64,
    pub available_supply: u64,
    pub version: u64,
}

/// Consistent view of every resource, taken under the engine lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub cycle: u64,
    pub taken_at: DateTime<Utc>,
    pub pricing: PricingPolicy,
    pub resources: BTreeMap<ResourceType, ResourceQuote>,
}

#[derive(Debug, Clone)]
pub struct Market {
    config: MarketConfig,
    states: PerResource<MarketState>,
}

impl Market {
    pub fn new(config: MarketConfig) -> Self {
        let states = PerResource::from_fn(|resource| {
            let cfg = config.resources.get(resource);
            MarketState {
                resource,
                available_supply: cfg.available_supply,
                utilization: 0.0,
                current_price: cfg.initial_price,
                last_allocated: 0,
                version: 0,
                updated_at: None,
            }
        });
        Self { config, states }
    }

    /// Rebuild from persisted states. Supply always comes from the current
    /// configuration; prices are clamped into the configured bounds.
    pub fn from_states(config: MarketConfig, persisted: PerResource<MarketState>) -> Self {
        let states = PerResource::from_fn(|resource| {
            let mut state = persisted.get(resource).clone();
            state.resource = resource;
            state.available_supply = config.resources.get(resource).available_supply;
            state.current_price = state
                .current_price
                .clamp(config.min_price, config.max_price);
            state
        });
        Self { config, states }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn states(&self) -> &PerResource<MarketState> {
        &self.states
    }

    pub fn state(&self, resource: ResourceType) -> &MarketState {
        self.states.get(resource)
    }

    pub fn price(&self, resource: ResourceType) -> Credits {
        self.state(resource).current_price
    }

    pub fn utilization(&self, resource: ResourceType) -> f64 {
        self.state(resource).utilization
    }

    pub fn available_supply(&self, resource: ResourceType) -> u64 {
        self.state(resource).available_supply
    }

    pub fn pricing(&self) -> PricingPolicy {
        self.config.pricing
    }

    /// `ceil(Σ amount × price × duration_ms / 1000)`.
    pub fn quote(&self, bundle: &ResourceBundle) -> Result<Credits, EconomyError> {
        let mut total: u128 = 0;
        for (resource, amount) in bundle.amounts.named() {
            let term = amount as u128
                * self.price(resource).minor() as u128
                * bundle.duration_ms as u128;
            total = total
                .checked_add(term)
                .ok_or_else(|| EconomyError::InvalidBundle("bundle quote overflows".into()))?;
        }
        let quote = total.div_ceil(1_000);
        u64::try_from(quote)
            .map(Credits::from_minor)
            .map_err(|_| EconomyError::InvalidBundle("bundle quote overflows".into()))
    }

    /// Record this cycle's allocation and, under the threshold policy, step
    /// the price when utilization leaves the `[low, high]` band.
    pub fn apply_utilization_update(
        &mut self,
        resource: ResourceType,
        allocated_amount: u64,
        now: DateTime<Utc>,
    ) -> PriceUpdate {
        let pricing = self.config.pricing;
        let high = self.config.high_utilization;
        let low = self.config.low_utilization;
        let (min_price, max_price) = (self.config.min_price, self.config.max_price);
        let (increase_bps, decrease_bps) = (self.config.increase_bps, self.config.decrease_bps);

        let state = self.states.get_mut(resource);
        let previous_price = state.current_price;
        let utilization = if state.available_supply == 0 {
            0.0
        } else {
            (allocated_amount as f64 / state.available_supply as f64).min(1.0)
        };

        if pricing == PricingPolicy::Threshold {
            if utilization > high {
                state.current_price = step_up(previous_price, increase_bps, max_price);
            } else if utilization < low {
                state.current_price = step_down(previous_price, decrease_bps, min_price);
            }
        }

        state.utilization = utilization;
        state.last_allocated = allocated_amount;
        state.version += 1;
        state.updated_at = Some(now);

        debug!(
            resource = %resource,
            utilization,
            previous = %previous_price,
            price = %state.current_price,
            "Market utilization updated"
        );

        PriceUpdate {
            resource,
            previous_price,
            new_price: state.current_price,
            utilization,
            version: state.version,
        }
    }

    /// Marginal-clearing price: credits paid by this cycle's winners per
    /// capacity-second. No-op under the threshold policy or without winners.
    pub fn apply_clearing_price(
        &mut self,
        resource: ResourceType,
        winning_credits: Credits,
        capacity_ms: u128,
        now: DateTime<Utc>,
    ) -> Option<PriceUpdate> {
        if self.config.pricing != PricingPolicy::MarginalClearing || capacity_ms == 0 {
            return None;
        }
        let (min_price, max_price) = (self.config.min_price, self.config.max_price);
        let state = self.states.get_mut(resource);
        let previous_price = state.current_price;

        let discovered = winning_credits.minor() as u128 * 1_000 / capacity_ms;
        let discovered = Credits::from_minor(discovered.min(u64::MAX as u128) as u64);
        state.current_price = discovered.clamp(min_price, max_price);
        state.version += 1;
        state.updated_at = Some(now);

        Some(PriceUpdate {
            resource,
            previous_price,
            new_price: state.current_price,
            utilization: state.utilization,
            version: state.version,
        })
    }

    pub fn snapshot(&self, cycle: u64, now: DateTime<Utc>) -> MarketSnapshot {
        let resources = self
            .states
            .iter()
            .map(|(resource, state)| {
                (
                    resource,
                    ResourceQuote {
                        price: state.current_price,
                        utilization: state.utilization,
                        available_supply: state.available_supply,
                        version: state.version,
                    },
                )
            })
            .collect();

        MarketSnapshot {
            cycle,
            taken_at: now,
            pricing: self.config.pricing,
            resources,
        }
    }
}

fn step_up(price: Credits, bps: u32, max: Credits) -> Credits {
    let raised = price.minor() as u128 * (BPS + bps as u128) / BPS;
    // Always move by at least one minor unit so tiny prices can still rise.
    let raised = raised.max(price.minor() as u128 + 1);
    Credits::from_minor(raised.min(max.minor() as u128) as u64)
}

fn step_down(price: Credits, bps: u32, min: Credits) -> Credits {
    let lowered = price.minor() as u128 * (BPS - (bps as u128).min(BPS)) / BPS;
    Credits::from_minor(lowered as u64).max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> Market {
        Market::new(MarketConfig::default())
    }

    #[test]
    fn quote_sums_amount_price_duration() {
        let market = market();
        // 2 cpu @ 1.000/s for 1.5 s + 100 tokens @ 0.001/s for 1.5 s
        let bundle = ResourceBundle::new(1_500)
            .with(ResourceType::Cpu, 2)
            .with(ResourceType::Tokens, 100);
        assert_eq!(market.quote(&bundle).unwrap(), Credits::from_minor(3_150));
    }

    #[test]
    fn quote_rounds_up() {
        let market = market();
        let bundle = ResourceBundle::new(1).with(ResourceType::Tokens, 1);
        assert_eq!(market.quote(&bundle).unwrap(), Credits::from_minor(1));
    }

    #[test]
    fn utilization_is_fraction_of_supply() {
        let mut market = market();
        let update = market.apply_utilization_update(ResourceType::Cpu, 1, Utc::now());
        assert!((update.utilization - 0.1).abs() < f64::EPSILON);
        assert!((market.utilization(ResourceType::Cpu) - 0.1).abs() < f64::EPSILON);
        assert_eq!(market.state(ResourceType::Cpu).version, 1);
    }

    #[test]
    fn high_utilization_raises_price_by_bounded_step() {
        let mut market = market();
        let update = market.apply_utilization_update(ResourceType::Cpu, 9, Utc::now());
        assert_eq!(update.previous_price, Credits::from_credits(1));
        assert_eq!(update.new_price, Credits::from_minor(1_100));
    }

    #[test]
    fn low_utilization_lowers_price_but_never_below_floor() {
        let mut market = market();
        for _ in 0..500 {
            market.apply_utilization_update(ResourceType::Cpu, 0, Utc::now());
        }
        assert_eq!(market.price(ResourceType::Cpu), market.config().min_price);
        assert!(!market.price(ResourceType::Cpu).is_zero());
    }

    #[test]
    fn price_is_capped() {
        let mut market = market();
        for _ in 0..500 {
            market.apply_utilization_update(ResourceType::Cpu, 10, Utc::now());
        }
        assert_eq!(market.price(ResourceType::Cpu), market.config().max_price);
    }

    #[test]
    fn mid_band_leaves_price_unchanged() {
        let mut market = market();
        let update = market.apply_utilization_update(ResourceType::Cpu, 5, Utc::now());
        assert!(!update.changed());
    }

    #[test]
    fn marginal_clearing_prices_by_capacity_seconds() {
        let config = MarketConfig {
            pricing: PricingPolicy::MarginalClearing,
            ..MarketConfig::default()
        };
        let mut market = Market::new(config);
        // 1 cpu x 10 s and 2 cpu x 5 s paid 200 credits in total.
        let update = market
            .apply_clearing_price(
                ResourceType::Cpu,
                Credits::from_credits(200),
                20_000,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(update.new_price, Credits::from_credits(10));

        // Utilization never moves the price under this policy.
        let update = market.apply_utilization_update(ResourceType::Cpu, 10, Utc::now());
        assert!(!update.changed());
    }

    #[test]
    fn threshold_policy_ignores_clearing_price() {
        let mut market = market();
        assert!(market
            .apply_clearing_price(ResourceType::Cpu, Credits::from_credits(5), 1_000, Utc::now())
            .is_none());
    }

    #[test]
    fn restored_supply_follows_config() {
        let mut market = market();
        market.apply_utilization_update(ResourceType::Cpu, 10, Utc::now());
        let persisted = market.states().clone();

        let mut config = MarketConfig::default();
        config.resources.cpu.available_supply = 20;
        let restored = Market::from_states(config, persisted);
        assert_eq!(restored.available_supply(ResourceType::Cpu), 20);
        assert_eq!(restored.price(ResourceType::Cpu), Credits::from_minor(1_100));
    }

    #[test]
    fn snapshot_covers_every_resource() {
        let snapshot = market().snapshot(3, Utc::now());
        assert_eq!(snapshot.cycle, 3);
        assert_eq!(snapshot.resources.len(), ResourceType::ALL.len());
        assert_eq!(snapshot.resources[&ResourceType::Attention].available_supply, 1);
    }
}
