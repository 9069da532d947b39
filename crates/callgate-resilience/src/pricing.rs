//! Per-model token pricing.

use callgate_config::{ModelPrice, PricingConfig};
use std::collections::HashMap;

/// Cost lookup for generator models, in USD per million tokens
#[derive(Debug, Clone)]
pub struct PriceTable {
    default_model: String,
    models: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl PriceTable {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &PricingConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            models: config.models.clone(),
            fallback: config.fallback,
        }
    }

    /// Model charged when none is named
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Price for `model`.
    ///
    /// Exact names win; otherwise the longest configured prefix matches, so
    /// dated releases such as `claude-3-5-sonnet-20241022` share the family
    /// price. Unknown models use the fallback.
    #[must_use]
    pub fn price(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.models.get(model) {
            return *price;
        }
        self.models
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map_or(self.fallback, |(_, price)| *price)
    }

    /// Cost of a call in USD
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.price(model);
        (input_tokens as f64 * price.input_per_million
            + output_tokens as f64 * price.output_per_million)
            / 1_000_000.0
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sonnet_pricing() {
        let table = PriceTable::default();
        let cost = table.cost("claude-3-5-sonnet", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);

        let cost = table.cost("claude-3-5-sonnet", 1000, 500);
        assert!((cost - 0.0105).abs() < 1e-12);
    }

    #[test]
    fn test_prefix_and_fallback() {
        let table = PriceTable::default();
        assert_eq!(table.price("claude-3-5-sonnet-20241022"), ModelPrice::new(3.0, 15.0));
        assert_eq!(table.price("claude-3-haiku-20240307"), ModelPrice::new(0.25, 1.25));
        assert_eq!(table.price("something-else"), ModelPrice::new(3.0, 15.0));
    }
}
