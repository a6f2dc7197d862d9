use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use batch_orchestrator::{BatchLimits, DEFAULT_LOOKBACK_HOURS};
use rust_decimal::Decimal;

/// Process-level settings. Model endpoints and prices are loaded by their own crates.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Storage
    pub database_url: String,
    pub claim_ttl_secs: i64,

    // News + market data
    pub polygon_api_key: String,
    pub reaction_threshold_pct: f64,
    /// How far back the very first batch reaches, before any cursor exists
    pub news_lookback_hours: i64,

    // Batch schedule
    pub batch: BatchLimits,
    pub batch_interval_secs: u64,

    // On-demand API
    pub on_demand_rate_limit: u32,
    pub on_demand_window_secs: u64,
    pub api_bind_addr: SocketAddr,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        Ok(Self {
            database_url: var("DATABASE_URL", "sqlite:signals.db"),
            claim_ttl_secs: parse("CLAIM_TTL_SECS", &var("CLAIM_TTL_SECS", "900"))?,

            polygon_api_key: get("POLYGON_API_KEY").context("POLYGON_API_KEY must be set")?,
            reaction_threshold_pct: parse(
                "REACTION_THRESHOLD_PCT",
                &var("REACTION_THRESHOLD_PCT", "1.0"),
            )?,
            news_lookback_hours: match get("NEWS_LOOKBACK_HOURS") {
                Some(raw) => parse("NEWS_LOOKBACK_HOURS", &raw)?,
                None => DEFAULT_LOOKBACK_HOURS,
            },

            batch: BatchLimits {
                max_items: parse("BATCH_MAX_ITEMS", &var("BATCH_MAX_ITEMS", "50"))?,
                max_concurrency: parse("BATCH_MAX_CONCURRENCY", &var("BATCH_MAX_CONCURRENCY", "4"))?,
                // Decimal straight from the string, never through f64
                max_cost_budget: parse("BATCH_MAX_COST_USD", &var("BATCH_MAX_COST_USD", "1.00"))?,
                deadline: Duration::from_secs(parse(
                    "BATCH_DEADLINE_SECS",
                    &var("BATCH_DEADLINE_SECS", "240"),
                )?),
            },
            batch_interval_secs: parse("BATCH_INTERVAL_SECS", &var("BATCH_INTERVAL_SECS", "300"))?,

            on_demand_rate_limit: parse("ON_DEMAND_RATE_LIMIT", &var("ON_DEMAND_RATE_LIMIT", "10"))?,
            on_demand_window_secs: parse(
                "ON_DEMAND_WINDOW_SECS",
                &var("ON_DEMAND_WINDOW_SECS", "60"),
            )?,
            api_bind_addr: parse("API_BIND_ADDR", &var("API_BIND_ADDR", "0.0.0.0:3100"))?,
        })
    }

    /// Reject settings that would make the agent silently do nothing
    pub fn validate(&self) -> Result<()> {
        if self.polygon_api_key.trim().is_empty() {
            bail!("POLYGON_API_KEY is empty");
        }
        if self.batch.max_items == 0 {
            bail!("BATCH_MAX_ITEMS must be at least 1");
        }
        if self.batch.max_concurrency == 0 {
            bail!("BATCH_MAX_CONCURRENCY must be at least 1");
        }
        if self.batch.max_cost_budget < Decimal::ZERO {
            bail!("BATCH_MAX_COST_USD must not be negative, got {}", self.batch.max_cost_budget);
        }
        if self.batch_interval_secs == 0 {
            bail!("BATCH_INTERVAL_SECS must be positive");
        }
        if self.on_demand_rate_limit == 0 {
            bail!("ON_DEMAND_RATE_LIMIT must be at least 1");
        }
        if self.on_demand_window_secs == 0 {
            bail!("ON_DEMAND_WINDOW_SECS must be positive");
        }
        if self.claim_ttl_secs <= 0 {
            bail!("CLAIM_TTL_SECS must be positive");
        }
        if self.news_lookback_hours <= 0 {
            bail!("NEWS_LOOKBACK_HOURS must be positive");
        }
        if self.reaction_threshold_pct.is_nan() || self.reaction_threshold_pct < 0.0 {
            bail!("REACTION_THRESHOLD_PCT must be non-negative");
        }
        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn on_demand_window(&self) -> Duration {
        Duration::from_secs(self.on_demand_window_secs)
    }

    pub fn news_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.news_lookback_hours)
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid {}: '{}'", name, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("POLYGON_API_KEY", "pk")]).unwrap();
        config.validate().unwrap();

        assert_eq!(config.database_url, "sqlite:signals.db");
        assert_eq!(config.batch, BatchLimits::default());
        assert_eq!(config.batch.max_cost_budget, dec!(1.00));
        assert_eq!(config.batch_interval(), Duration::from_secs(300));
        assert_eq!(config.on_demand_rate_limit, 10);
        assert_eq!(config.on_demand_window(), Duration::from_secs(60));
        assert_eq!(config.claim_ttl_secs, 900);
        assert_eq!(config.api_bind_addr.port(), 3100);
        assert_eq!(config.news_lookback(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_budget_keeps_exact_decimal() {
        let config = config_from(&[("POLYGON_API_KEY", "pk"), ("BATCH_MAX_COST_USD", "0.10")]).unwrap();
        assert_eq!(config.batch.max_cost_budget, dec!(0.10));
    }

    #[test]
    fn test_missing_key_and_bad_values() {
        assert!(config_from(&[]).is_err());

        let err = config_from(&[("POLYGON_API_KEY", "pk"), ("BATCH_MAX_ITEMS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("BATCH_MAX_ITEMS"));

        let zero = config_from(&[("POLYGON_API_KEY", "pk"), ("BATCH_MAX_CONCURRENCY", "0")]).unwrap();
        assert!(zero.validate().is_err());

        let negative = config_from(&[("POLYGON_API_KEY", "pk"), ("BATCH_MAX_COST_USD", "-1")]).unwrap();
        assert!(negative.validate().is_err());

        let no_window = config_from(&[("POLYGON_API_KEY", "pk"), ("NEWS_LOOKBACK_HOURS", "0")]).unwrap();
        assert!(no_window.validate().is_err());
    }
}
