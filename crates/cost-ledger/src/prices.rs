use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::ModelRole;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriceTableError {
    #[error("Invalid price in {var}: '{value}'")]
    InvalidPrice { var: String, value: String },

    #[error("Negative price in {var}: {value}")]
    NegativePrice { var: String, value: Decimal },
}

/// USD per token for one model role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_token: Decimal,
    pub output_per_token: Decimal,
}

impl ModelPrice {
    pub fn new(input_per_token: Decimal, output_per_token: Decimal) -> Self {
        Self {
            input_per_token,
            output_per_token,
        }
    }
}

/// Static price configuration for the three model roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    pub screening: ModelPrice,
    pub research: ModelPrice,
    pub synthesis: ModelPrice,
}

impl PriceTable {
    pub fn price(&self, role: ModelRole) -> &ModelPrice {
        match role {
            ModelRole::Screening => &self.screening,
            ModelRole::Research => &self.research,
            ModelRole::Synthesis => &self.synthesis,
        }
    }

    /// Load from `<ROLE>_PRICE_IN` / `<ROLE>_PRICE_OUT`, falling back to the defaults.
    pub fn from_env() -> Result<Self, PriceTableError> {
        let defaults = Self::default();
        Ok(Self {
            screening: price_from_env("SCREENING", &defaults.screening)?,
            research: price_from_env("RESEARCH", &defaults.research)?,
            synthesis: price_from_env("SYNTHESIS", &defaults.synthesis)?,
        })
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        // Fast screening model, retrieval research model, frontier synthesis model
        Self {
            screening: ModelPrice::new(Decimal::new(15, 8), Decimal::new(60, 8)),
            research: ModelPrice::new(Decimal::new(100, 8), Decimal::new(100, 8)),
            synthesis: ModelPrice::new(Decimal::new(300, 8), Decimal::new(1500, 8)),
        }
    }
}

fn price_from_env(prefix: &str, fallback: &ModelPrice) -> Result<ModelPrice, PriceTableError> {
    Ok(ModelPrice {
        input_per_token: decimal_var(&format!("{}_PRICE_IN", prefix), fallback.input_per_token)?,
        output_per_token: decimal_var(&format!("{}_PRICE_OUT", prefix), fallback.output_per_token)?,
    })
}

fn decimal_var(var: &str, fallback: Decimal) -> Result<Decimal, PriceTableError> {
    match env::var(var) {
        Ok(raw) => parse_price(var, &raw),
        Err(_) => Ok(fallback),
    }
}

fn parse_price(var: &str, raw: &str) -> Result<Decimal, PriceTableError> {
    let value = Decimal::from_str(raw.trim()).map_err(|_| PriceTableError::InvalidPrice {
        var: var.to_string(),
        value: raw.to_string(),
    })?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(PriceTableError::NegativePrice {
            var: var.to_string(),
            value,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("X", "0.00000015").unwrap(), dec!(0.00000015));
        assert_eq!(parse_price("X", " 0.000003 ").unwrap(), dec!(0.000003));
        assert!(matches!(
            parse_price("X", "cheap"),
            Err(PriceTableError::InvalidPrice { .. })
        ));
        assert!(matches!(
            parse_price("X", "-0.1"),
            Err(PriceTableError::NegativePrice { .. })
        ));
    }

    #[test]
    fn test_default_table_lookup() {
        let table = PriceTable::default();
        assert_eq!(table.price(ModelRole::Screening).input_per_token, dec!(0.00000015));
        assert_eq!(table.price(ModelRole::Synthesis).output_per_token, dec!(0.000015));
    }
}
