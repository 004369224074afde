//! Per-job model usage accounting.
//!
//! A [`UsageAccumulator`] is created when a job starts, passed by mutable
//! reference to every collaborator call that consumes an inference model,
//! and folded into the completion event as [`LlmUsage`]. It is never shared
//! between jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Token counts for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub cached_tokens: u64,
}

impl ModelUsage {
    fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.thinking_tokens += other.thinking_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

/// Wire shape of the `llmUsage` field on job events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmUsage {
    pub models: BTreeMap<String, ModelUsage>,
    pub total_cost_usd: f64,
}

#[derive(Debug, Default)]
pub struct UsageAccumulator {
    models: BTreeMap<String, ModelUsage>,
    total_cost_usd: f64,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one model call's usage and its cost.
    pub fn record(&mut self, model: &str, usage: ModelUsage, cost_usd: f64) {
        self.models.entry(model.to_string()).or_default().add(&usage);
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.total_cost_usd += cost_usd;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Consume the accumulator; `None` when no model was called.
    pub fn finish(self) -> Option<LlmUsage> {
        if self.models.is_empty() {
            return None;
        }
        Some(LlmUsage {
            models: self.models,
            total_cost_usd: self.total_cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_accumulator_finishes_to_none() {
        assert!(UsageAccumulator::new().finish().is_none());
    }

    #[test]
    fn usage_is_summed_per_model() {
        let mut acc = UsageAccumulator::new();
        let call = ModelUsage {
            input_tokens: 100,
            output_tokens: 20,
            thinking_tokens: 5,
            cached_tokens: 0,
        };
        acc.record("vision-small", call, 0.01);
        acc.record("vision-small", call, 0.01);
        acc.record("vision-large", call, 0.05);

        let usage = acc.finish().unwrap();
        assert_eq!(usage.models["vision-small"].input_tokens, 200);
        assert_eq!(usage.models["vision-large"].output_tokens, 20);
        assert!((usage.total_cost_usd - 0.07).abs() < 1e-9);
    }

    #[test]
    fn serialises_with_camel_case_fields() {
        let mut acc = UsageAccumulator::new();
        acc.record("m", ModelUsage { input_tokens: 1, ..Default::default() }, 0.5);
        let json = serde_json::to_value(acc.finish().unwrap()).unwrap();
        assert_eq!(json["models"]["m"]["inputTokens"], 1);
        assert_eq!(json["models"]["m"]["cachedTokens"], 0);
        assert_eq!(json["totalCostUsd"], 0.5);
    }
}
