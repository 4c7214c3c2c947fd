// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cost attribution reports, anomaly detection, and recommendations.

use crate::{CostMetrics, PricingTable};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tuning for [`attribute`].
#[derive(Debug, Clone)]
pub struct AttributionOptions {
    pub include_tenants: bool,
    pub include_recommendations: bool,
    pub top_spender_limit: usize,
    /// A spike fires when an hourly bucket exceeds this multiple of the
    /// median hourly baseline.
    pub anomaly_threshold: f64,
}

impl Default for AttributionOptions {
    fn default() -> Self {
        Self {
            include_tenants: true,
            include_recommendations: true,
            top_spender_limit: 5,
            anomaly_threshold: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    UnusualPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAnomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
    /// UTC hour-of-day for spikes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub observed_usd: f64,
    pub baseline_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Cache,
    Batch,
    ModelDowngrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecommendation {
    pub kind: RecommendationKind,
    /// Operation or `provider/model` the recommendation applies to.
    pub target: String,
    pub estimated_savings_usd: f64,
    pub description: String,
}

/// Per-operation rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationCost {
    pub cost_usd: f64,
    pub count: u64,
    pub avg_tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostAttributionReport {
    pub start_ms: u64,
    pub end_ms: u64,
    pub total_cost_usd: f64,
    pub total_operations: u64,
    pub by_tenant: BTreeMap<String, f64>,
    /// Highest-spending tenants, descending.
    pub top_spenders: Vec<(String, f64)>,
    pub by_operation: BTreeMap<String, OperationCost>,
    /// Keyed `provider/model`.
    pub by_provider_model: BTreeMap<String, f64>,
    /// UTC hour-of-day buckets.
    pub by_hour: [f64; 24],
    /// Keyed `YYYY-MM-DD` (UTC).
    pub by_day: BTreeMap<String, f64>,
    pub anomalies: Vec<CostAnomaly>,
    pub recommendations: Vec<CostRecommendation>,
}

/// Build the attribution report for a window of records.
pub(crate) fn attribute(
    records: &[CostMetrics],
    pricing: &PricingTable,
    start_ms: u64,
    end_ms: u64,
    options: AttributionOptions,
) -> CostAttributionReport {
    let mut report = CostAttributionReport {
        start_ms,
        end_ms,
        total_cost_usd: 0.0,
        total_operations: records.len() as u64,
        by_tenant: BTreeMap::new(),
        top_spenders: Vec::new(),
        by_operation: BTreeMap::new(),
        by_provider_model: BTreeMap::new(),
        by_hour: [0.0; 24],
        by_day: BTreeMap::new(),
        anomalies: Vec::new(),
        recommendations: Vec::new(),
    };

    let mut op_tokens: BTreeMap<String, u64> = BTreeMap::new();
    for record in records {
        report.total_cost_usd += record.cost_usd;

        if options.include_tenants {
            if let Some(tenant) = &record.tenant_id {
                *report.by_tenant.entry(tenant.clone()).or_default() += record.cost_usd;
            }
        }

        let op = report.by_operation.entry(record.operation.clone()).or_default();
        op.cost_usd += record.cost_usd;
        op.count += 1;
        *op_tokens.entry(record.operation.clone()).or_default() +=
            record.prompt_tokens + record.completion_tokens;

        *report
            .by_provider_model
            .entry(format!("{}/{}", record.provider, record.model))
            .or_default() += record.cost_usd;

        if let Some(when) = DateTime::<Utc>::from_timestamp_millis(record.timestamp_ms as i64) {
            report.by_hour[when.hour() as usize] += record.cost_usd;
            *report.by_day.entry(when.format("%Y-%m-%d").to_string()).or_default() +=
                record.cost_usd;
        }
    }

    for (operation, tokens) in op_tokens {
        if let Some(op) = report.by_operation.get_mut(&operation) {
            op.avg_tokens = tokens as f64 / op.count.max(1) as f64;
        }
    }

    report.top_spenders = {
        let mut spenders: Vec<(String, f64)> =
            report.by_tenant.iter().map(|(t, c)| (t.clone(), *c)).collect();
        spenders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        spenders.truncate(options.top_spender_limit);
        spenders
    };

    detect_spikes(&mut report, options.anomaly_threshold);
    detect_tenant_concentration(&mut report);

    if options.include_recommendations {
        recommend(&mut report, records, pricing);
    }

    report
}

/// Median chosen over mean for robustness against the spike itself.
fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn spike_severity(ratio: f64) -> Severity {
    if ratio > 5.0 {
        Severity::Critical
    } else if ratio > 3.0 {
        Severity::High
    } else {
        Severity::Medium
    }
}

fn detect_spikes(report: &mut CostAttributionReport, threshold: f64) {
    let active: Vec<f64> = report.by_hour.iter().copied().filter(|c| *c > 0.0).collect();
    let baseline = median(&active);
    if baseline <= 0.0 {
        return;
    }

    for (hour, observed) in report.by_hour.iter().enumerate() {
        if *observed > threshold * baseline {
            let ratio = observed / baseline;
            report.anomalies.push(CostAnomaly {
                kind: AnomalyKind::Spike,
                severity: spike_severity(ratio),
                description: format!(
                    "hour {hour:02}:00 UTC spent ${observed:.4}, {ratio:.1}x the \
                     ${baseline:.4} hourly baseline"
                ),
                hour: Some(hour as u32),
                tenant: None,
                observed_usd: *observed,
                baseline_usd: baseline,
            });
        }
    }
}

fn detect_tenant_concentration(report: &mut CostAttributionReport) {
    if report.total_cost_usd <= 0.0 {
        return;
    }
    for (tenant, cost) in &report.by_tenant {
        let share = cost / report.total_cost_usd;
        if share > 0.5 {
            report.anomalies.push(CostAnomaly {
                kind: AnomalyKind::UnusualPattern,
                severity: if share > 0.75 { Severity::High } else { Severity::Medium },
                description: format!(
                    "tenant '{tenant}' accounts for {:.0}% of total spend",
                    share * 100.0
                ),
                hour: None,
                tenant: Some(tenant.clone()),
                observed_usd: *cost,
                baseline_usd: report.total_cost_usd,
            });
        }
    }
}

/// Cacheable repeats, batchable bursts, and downgradable premium models,
/// sorted by estimated savings.
fn recommend(
    report: &mut CostAttributionReport,
    records: &[CostMetrics],
    pricing: &PricingTable,
) {
    for (operation, op) in &report.by_operation {
        if op.count > 100 {
            report.recommendations.push(CostRecommendation {
                kind: RecommendationKind::Cache,
                target: operation.clone(),
                estimated_savings_usd: op.cost_usd * 0.7,
                description: format!(
                    "'{operation}' ran {} times in the window; cache its results",
                    op.count
                ),
            });
        }
    }

    // Batching: bursts of >5 records for one operation within one minute.
    let mut minute_groups: BTreeMap<(u64, String), (u64, f64)> = BTreeMap::new();
    for record in records {
        let group = minute_groups
            .entry((record.timestamp_ms / 60_000, record.operation.clone()))
            .or_default();
        group.0 += 1;
        group.1 += record.cost_usd;
    }
    let mut batchable: BTreeMap<String, f64> = BTreeMap::new();
    for ((_, operation), (count, cost)) in minute_groups {
        if count > 5 {
            *batchable.entry(operation).or_default() += cost;
        }
    }
    for (operation, cost) in batchable {
        report.recommendations.push(CostRecommendation {
            kind: RecommendationKind::Batch,
            target: operation.clone(),
            estimated_savings_usd: cost * 0.4,
            description: format!("'{operation}' bursts within single minutes; batch requests"),
        });
    }

    // Model downgrade: premium models doing small completions.
    let mut model_stats: BTreeMap<(String, String), (u64, u64, f64)> = BTreeMap::new();
    for record in records {
        let stats = model_stats
            .entry((record.provider.clone(), record.model.clone()))
            .or_default();
        stats.0 += 1;
        stats.1 += record.prompt_tokens + record.completion_tokens;
        stats.2 += record.cost_usd;
    }
    for ((provider, model), (count, tokens, cost)) in model_stats {
        let avg_tokens = tokens as f64 / count.max(1) as f64;
        if pricing.is_expensive(&provider, &model) && avg_tokens < 500.0 {
            report.recommendations.push(CostRecommendation {
                kind: RecommendationKind::ModelDowngrade,
                target: format!("{provider}/{model}"),
                estimated_savings_usd: cost * 0.5,
                description: format!(
                    "{provider}/{model} averages {avg_tokens:.0} tokens per call; \
                     a smaller model would do"
                ),
            });
        }
    }

    report.recommendations.sort_by(|a, b| {
        b.estimated_savings_usd
            .partial_cmp(&a.estimated_savings_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
#[path = "attribution_tests.rs"]
mod tests;
