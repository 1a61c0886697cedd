//! Token accounting and cost estimation.
//!
//! A [`CostAccountant`] is owned by a single agent runtime. It prices every
//! model call against a per-model table and keeps a running aggregate until
//! [`CostAccountant::reset`] is called.

use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Token counts and estimated cost for one or more model calls.
///
/// Cost is held in whole nano-USD so that sums are exact and independent of
/// grouping; it crosses the wire as a USD float under `estimatedCost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(rename = "estimatedCost", with = "usd")]
    cost_nanos: u64,
}

impl TokenUsage {
    /// Negative or non-finite costs are recorded as zero.
    pub fn new(input_tokens: u64, output_tokens: u64, estimated_cost: f64) -> Self {
        Self::from_nanos(input_tokens, output_tokens, usd::to_nanos(estimated_cost))
    }

    fn from_nanos(input_tokens: u64, output_tokens: u64, cost_nanos: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost_nanos,
        }
    }

    /// Estimated cost in USD.
    pub fn estimated_cost(&self) -> f64 {
        usd::from_nanos(self.cost_nanos)
    }

    pub fn cost_nanos(&self) -> u64 {
        self.cost_nanos
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage::from_nanos(
            self.input_tokens.saturating_add(rhs.input_tokens),
            self.output_tokens.saturating_add(rhs.output_tokens),
            self.cost_nanos.saturating_add(rhs.cost_nanos),
        )
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), Add::add)
    }
}

impl<'a> Sum<&'a TokenUsage> for TokenUsage {
    fn sum<I: Iterator<Item = &'a TokenUsage>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

mod usd {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NANOS_PER_USD;

    pub(super) fn to_nanos(cost: f64) -> u64 {
        if !cost.is_finite() || cost <= 0.0 {
            return 0;
        }
        // `as` saturates at u64::MAX.
        (cost * NANOS_PER_USD).round() as u64
    }

    pub(super) fn from_nanos(nanos: u64) -> f64 {
        nanos as f64 / NANOS_PER_USD
    }

    pub fn serialize<S: Serializer>(nanos: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(from_nanos(*nanos))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        f64::deserialize(deserializer).map(to_nanos)
    }
}

/// USD price per thousand tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Pricing tiers keyed by model name, with a fallback for unknown models.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    tiers: BTreeMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert("gpt-4o".to_string(), ModelPricing::new(0.0025, 0.01));
        tiers.insert("gpt-4o-mini".to_string(), ModelPricing::new(0.00015, 0.0006));
        tiers.insert(
            "claude-3-5-sonnet".to_string(),
            ModelPricing::new(0.003, 0.015),
        );
        tiers.insert("gemini-1.5-pro".to_string(), ModelPricing::new(0.00125, 0.005));
        tiers.insert(
            "gemini-1.5-flash".to_string(),
            ModelPricing::new(0.000075, 0.0003),
        );
        Self {
            tiers,
            fallback: ModelPricing::new(0.000075, 0.0003),
        }
    }
}

impl PricingTable {
    pub fn with_tier(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.tiers.insert(model.into(), pricing);
        self
    }

    pub fn with_fallback(mut self, pricing: ModelPricing) -> Self {
        self.fallback = pricing;
        self
    }

    /// Exact match first, then the longest tier name that prefixes `model`
    /// (so dated snapshots like `gpt-4o-2024-08-06` price as `gpt-4o`).
    pub fn lookup(&self, model: &str) -> ModelPricing {
        if let Some(pricing) = self.tiers.get(model) {
            return *pricing;
        }
        self.tiers
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, pricing)| *pricing)
            .unwrap_or(self.fallback)
    }

    pub fn is_known(&self, model: &str) -> bool {
        self.tiers.keys().any(|name| model.starts_with(name.as_str()))
    }
}

/// Running totals across every call tracked since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub calls: u64,
    pub usage: TokenUsage,
    pub average_input_tokens: f64,
    pub average_output_tokens: f64,
    pub average_cost: f64,
}

#[derive(Clone)]
pub struct CostAccountant {
    model: String,
    pricing: ModelPricing,
    totals: Arc<Mutex<(u64, TokenUsage)>>,
}

impl CostAccountant {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_pricing(model, &PricingTable::default())
    }

    pub fn with_pricing(model: impl Into<String>, table: &PricingTable) -> Self {
        let model = model.into();
        if !table.is_known(&model) {
            tracing::debug!(model = %model, "no pricing tier for model, using default tier");
        }
        Self {
            pricing: table.lookup(&model),
            model,
            totals: Arc::new(Mutex::new((0, TokenUsage::default()))),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Prices one model call and folds it into the aggregate.
    pub fn track(&self, input_tokens: u64, output_tokens: u64) -> TokenUsage {
        let usage = TokenUsage::new(
            input_tokens,
            output_tokens,
            self.pricing.cost(input_tokens, output_tokens),
        );
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.0 += 1;
        totals.1 += usage;
        usage
    }

    pub fn summary(&self) -> CostSummary {
        let (calls, usage) = *self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        if calls == 0 {
            return CostSummary::default();
        }
        let n = calls as f64;
        CostSummary {
            calls,
            usage,
            average_input_tokens: usage.input_tokens as f64 / n,
            average_output_tokens: usage.output_tokens as f64 / n,
            average_cost: usage.estimated_cost() / n,
        }
    }

    pub fn reset(&self) {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner) = (0, TokenUsage::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_sum_of_input_and_output() {
        let usage = TokenUsage::new(120, 30, 0.5);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(TokenUsage::new(1, 1, -3.0).estimated_cost(), 0.0);
        assert_eq!(TokenUsage::new(1, 1, f64::NAN).cost_nanos(), 0);
    }

    #[test]
    fn unknown_model_uses_fallback_tier() {
        let table = PricingTable::default().with_fallback(ModelPricing::new(1.0, 2.0));
        let accountant = CostAccountant::with_pricing("mystery-model", &table);
        let usage = accountant.track(1000, 500);
        assert_eq!(usage.estimated_cost(), 2.0);
    }

    #[test]
    fn dated_snapshot_matches_longest_prefix() {
        let table = PricingTable::default();
        assert_eq!(
            table.lookup("gpt-4o-mini-2024-07-18"),
            ModelPricing::new(0.00015, 0.0006)
        );
        assert_eq!(table.lookup("gpt-4o-2024-08-06"), ModelPricing::new(0.0025, 0.01));
    }

    #[test]
    fn tracks_running_aggregate_and_resets() {
        let table = PricingTable::default().with_tier("unit", ModelPricing::new(1.0, 1.0));
        let accountant = CostAccountant::with_pricing("unit", &table);
        accountant.track(1000, 0);
        accountant.track(3000, 2000);

        let summary = accountant.summary();
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.usage.input_tokens, 4000);
        assert_eq!(summary.usage.output_tokens, 2000);
        assert_eq!(summary.usage.total_tokens, 6000);
        assert_eq!(summary.usage.estimated_cost(), 6.0);
        assert_eq!(summary.average_input_tokens, 2000.0);
        assert_eq!(summary.average_cost, 3.0);

        accountant.reset();
        assert_eq!(accountant.summary(), CostSummary::default());
    }

    #[test]
    fn clones_share_one_aggregate() {
        let accountant = CostAccountant::new("gpt-4o");
        let other = accountant.clone();
        other.track(10, 10);
        assert_eq!(accountant.summary().calls, 1);
    }

    #[test]
    fn aggregation_ignores_order_and_grouping() {
        let samples = [
            TokenUsage::new(10, 5, 0.1),
            TokenUsage::new(7, 3, 0.2),
            TokenUsage::new(0, 9, 0.3),
            TokenUsage::new(31, 0, 0.7),
        ];
        let forward: TokenUsage = samples.iter().sum();
        let backward: TokenUsage = samples.iter().rev().sum();
        let grouped = (samples[0] + samples[2]) + (samples[3] + samples[1]);
        let nested = samples[0] + (samples[1] + (samples[2] + samples[3]));

        assert_eq!(forward, backward);
        assert_eq!(forward, grouped);
        assert_eq!(forward, nested);
        assert_eq!(forward.total_tokens, forward.input_tokens + forward.output_tokens);
        assert_eq!(forward.cost_nanos(), 1_300_000_000);

        let (a, b, c) = (samples[0], samples[1], samples[2]);
        assert_eq!((a + b) + c, a + (b + c));
        assert_eq!((a + b + c).estimated_cost(), 0.6);
    }

    #[test]
    fn oversized_peer_counts_saturate_instead_of_overflowing() {
        let reported: TokenUsage = serde_json::from_value(serde_json::json!({
            "inputTokens": u64::MAX,
            "outputTokens": 1,
            "totalTokens": u64::MAX,
            "estimatedCost": 0.5
        }))
        .unwrap();
        let sum = reported + TokenUsage::new(1, 0, 0.0);

        assert_eq!(sum.input_tokens, u64::MAX);
        assert_eq!(sum.output_tokens, 1);
        assert_eq!(sum.total_tokens, u64::MAX);
        assert_eq!(TokenUsage::new(u64::MAX, u64::MAX, 0.0).total_tokens, u64::MAX);
    }

    #[test]
    fn cost_crosses_the_wire_as_usd() {
        let usage = TokenUsage::new(100, 20, 0.25);
        let value = serde_json::to_value(usage).unwrap();
        assert_eq!(value["estimatedCost"], serde_json::json!(0.25));
        assert_eq!(value["totalTokens"], serde_json::json!(120));

        let back: TokenUsage = serde_json::from_value(value).unwrap();
        assert_eq!(back, usage);
    }
}
