// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn known_model_uses_its_rate() {
    let table = PricingTable::default();
    let usage = TokenUsage { prompt_tokens: 1000, completion_tokens: 1000 };
    let cost = table.cost("openai", "gpt-4o", usage);
    assert!((cost - 0.0125).abs() < 1e-9);
}

#[test]
fn unknown_model_uses_the_fallback() {
    let table = PricingTable::default();
    let usage = TokenUsage { prompt_tokens: 2000, completion_tokens: 500 };
    let cost = table.cost("acme", "mystery-1", usage);
    assert!((cost - (0.002 + 0.001)).abs() < 1e-9);
}

#[test]
fn zero_usage_costs_nothing() {
    let table = PricingTable::default();
    assert_eq!(table.cost("openai", "gpt-4o", TokenUsage::default()), 0.0);
}

#[test]
fn expensive_flag_is_exposed() {
    let table = PricingTable::default();
    assert!(table.is_expensive("openai", "gpt-4o"));
    assert!(!table.is_expensive("openai", "gpt-4o-mini"));
    assert!(!table.is_expensive("acme", "mystery-1"));
}
