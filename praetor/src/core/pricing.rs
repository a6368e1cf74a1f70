//! Cost derivation from token usage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::budget::format_cost;
use crate::task::TokenUsage;

/// Provider prefixes tried when a model name has no exact entry.
const PROVIDER_PREFIXES: &[&str] = &[
    "anthropic/",
    "openai/",
    "azure/",
    "google/",
    "bedrock/",
    "vertex_ai/",
    "groq/",
    "together_ai/",
];

/// Per-token USD prices for one model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPrice {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

/// Model name to price.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    pub models: BTreeMap<String, ModelPrice>,
}

impl PriceTable {
    /// Exact match first, then each provider prefix in turn.
    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        if let Some(price) = self.models.get(model) {
            return Some(*price);
        }
        PROVIDER_PREFIXES
            .iter()
            .find_map(|prefix| self.models.get(&format!("{prefix}{model}")).copied())
    }

    /// Cost of `usage` under `model`, or `None` when the model is unknown.
    pub fn estimate(&self, model: &str, usage: TokenUsage) -> Option<f64> {
        let price = self.price_for(model)?;
        Some(
            usage.input as f64 * price.input_cost_per_token
                + usage.output as f64 * price.output_cost_per_token,
        )
    }

    /// [`Self::estimate`] rendered in the persisted decimal form.
    pub fn estimate_cost(&self, model: &str, usage: TokenUsage) -> Option<String> {
        if model.is_empty() {
            return None;
        }
        self.estimate(model, usage).map(format_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        let mut models = BTreeMap::new();
        models.insert(
            "anthropic/claude-sonnet".to_string(),
            ModelPrice {
                input_cost_per_token: 0.000_003,
                output_cost_per_token: 0.000_015,
            },
        );
        models.insert(
            "gpt-small".to_string(),
            ModelPrice {
                input_cost_per_token: 0.000_001,
                output_cost_per_token: 0.000_002,
            },
        );
        PriceTable { models }
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(
            table().estimate_cost("gpt-small", TokenUsage::new(1000, 500)),
            Some("0.002000".to_string())
        );
    }

    #[test]
    fn provider_prefix_is_tried() {
        assert_eq!(
            table().estimate_cost("claude-sonnet", TokenUsage::new(1000, 1000)),
            Some("0.018000".to_string())
        );
    }

    #[test]
    fn unknown_model_has_no_cost() {
        assert_eq!(table().estimate_cost("mystery", TokenUsage::new(1, 1)), None);
        assert_eq!(table().estimate_cost("", TokenUsage::new(1, 1)), None);
    }
}
