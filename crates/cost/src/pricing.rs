// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Static pricing table keyed by `(provider, model)`.

use crate::TokenUsage;
use std::collections::HashMap;

/// Per-1k-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub prompt_per_1k_usd: f64,
    pub completion_per_1k_usd: f64,
    /// Marks premium models for downgrade recommendations.
    pub expensive: bool,
}

impl Pricing {
    pub const fn new(prompt_per_1k_usd: f64, completion_per_1k_usd: f64, expensive: bool) -> Self {
        Self { prompt_per_1k_usd, completion_per_1k_usd, expensive }
    }
}

/// Rates for every model the orchestrator dispatches to, with a fallback
/// rate for unknown models.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<(String, String), Pricing>,
    fallback: Pricing,
}

impl PricingTable {
    pub fn new(fallback: Pricing) -> Self {
        Self { rates: HashMap::new(), fallback }
    }

    pub fn with_rate(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        pricing: Pricing,
    ) -> Self {
        self.rates.insert((provider.into(), model.into()), pricing);
        self
    }

    pub fn get(&self, provider: &str, model: &str) -> Pricing {
        self.rates
            .get(&(provider.to_string(), model.to_string()))
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn is_expensive(&self, provider: &str, model: &str) -> bool {
        self.get(provider, model).expensive
    }

    pub fn cost(&self, provider: &str, model: &str, usage: TokenUsage) -> f64 {
        let pricing = self.get(provider, model);
        (usage.prompt_tokens as f64 / 1000.0) * pricing.prompt_per_1k_usd
            + (usage.completion_tokens as f64 / 1000.0) * pricing.completion_per_1k_usd
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(Pricing::new(0.001, 0.002, false))
            .with_rate("openai", "gpt-4o", Pricing::new(0.0025, 0.01, true))
            .with_rate("openai", "gpt-4o-mini", Pricing::new(0.00015, 0.0006, false))
            .with_rate("anthropic", "claude-sonnet-4", Pricing::new(0.003, 0.015, true))
            .with_rate("anthropic", "claude-haiku-3-5", Pricing::new(0.0008, 0.004, false))
    }
}

#[cfg(test)]
#[path = "pricing_tests.rs"]
mod tests;
