//! Token and cost aggregation.
//!
//! A single turn can involve several models (Claude Code routes small tasks to
//! a cheaper model, for instance) and each reports its own usage block. This
//! module folds those blocks into one [`UsageStats`] and estimates how full
//! the context window is.
//!
//! # Why MAX, not SUM
//!
//! Every model in a turn re-reads roughly the same conversation context, so
//! adding their input counts double-counts that context. Taking the largest
//! count per field reflects the single biggest context read. Cost is the
//! exception: every call is billed, so cost adds up.
//!
//! This assumes the models see about the same context. Agents that fan out
//! to models with very different inputs would under-report, which is worth
//! checking against real telemetry before relying on the numbers for billing.

use serde::{Deserialize, Serialize};

use crate::agents::event::UsageStats;
use crate::agents::AgentKind;

/// Usage reported for one model within a turn.
///
/// Field names follow Claude Code's `modelUsage` map; every field is optional
/// on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    pub context_window: Option<u64>,
}

/// Combine per-model usage into one record.
///
/// - Token counts and the context window are the MAX across `models`.
/// - `fallback` (usually the turn-level usage block) is used when no
///   per-model data was reported.
/// - `total_cost_usd` wins when the agent reports a turn total; otherwise the
///   per-model costs are summed.
/// - `default_context_window` is used when no model reported a window.
pub fn aggregate_model_usage(
    models: &[ModelUsage],
    fallback: Option<&ModelUsage>,
    total_cost_usd: Option<f64>,
    default_context_window: u64,
) -> UsageStats {
    let sources: &[ModelUsage] = if models.is_empty() {
        fallback.map(std::slice::from_ref).unwrap_or(&[])
    } else {
        models
    };

    let mut stats = UsageStats::default();
    let mut summed_cost = 0.0;
    let mut reported_window: Option<u64> = None;

    for model in sources {
        stats.input_tokens = stats.input_tokens.max(model.input_tokens);
        stats.output_tokens = stats.output_tokens.max(model.output_tokens);
        stats.cache_read_input_tokens = stats
            .cache_read_input_tokens
            .max(model.cache_read_input_tokens);
        stats.cache_creation_input_tokens = stats
            .cache_creation_input_tokens
            .max(model.cache_creation_input_tokens);
        summed_cost += model.cost_usd;
        if let Some(window) = model.context_window.filter(|w| *w > 0) {
            reported_window = Some(reported_window.map_or(window, |w| w.max(window)));
        }
    }

    stats.total_cost_usd = total_cost_usd.unwrap_or(summed_cost);
    stats.context_window = reported_window.unwrap_or(default_context_window);
    stats
}

/// Tokens that count against the context window for this agent.
///
/// Most providers limit input only (`input + cache_read + cache_creation`).
/// Agents with a combined input+output limit count output instead of cache
/// reads, which their providers report separately.
pub fn context_tokens(stats: &UsageStats, agent: AgentKind) -> u64 {
    if agent.uses_combined_context() {
        stats.input_tokens + stats.cache_creation_input_tokens + stats.output_tokens
    } else {
        stats.input_tokens + stats.cache_read_input_tokens + stats.cache_creation_input_tokens
    }
}

/// Estimate context-window fill as a percentage (0..=100).
///
/// Returns `None` when the window is unknown or when the token total exceeds
/// it. A single call can never exceed its window, so a total above it means
/// the counts were accumulated over several internal calls; the caller should
/// keep showing its last good value.
pub fn estimate_context_usage(stats: &UsageStats, agent: AgentKind) -> Option<u8> {
    if stats.context_window == 0 {
        return None;
    }
    let total = context_tokens(stats, agent);
    if total > stats.context_window {
        return None;
    }
    let percent = (total as f64 / stats.context_window as f64 * 100.0).round();
    Some(percent as u8)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn model(input: u64, output: u64, cost: f64, window: Option<u64>) -> ModelUsage {
        ModelUsage {
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
            context_window: window,
            ..Default::default()
        }
    }

    mod aggregate {
        use super::*;

        #[test]
        fn takes_max_not_sum_of_tokens() {
            let models = [model(1_000, 50, 0.01, None), model(40_000, 900, 0.20, None)];
            let stats = aggregate_model_usage(&models, None, None, 200_000);
            assert_eq!(stats.input_tokens, 40_000);
            assert_eq!(stats.output_tokens, 900);
        }

        #[test]
        fn single_model_is_identity() {
            let models = [model(123, 45, 0.5, Some(100_000))];
            let stats = aggregate_model_usage(&models, None, None, 200_000);
            assert_eq!(stats.input_tokens, 123);
            assert_eq!(stats.output_tokens, 45);
            assert_eq!(stats.context_window, 100_000);
        }

        #[test]
        fn sums_cost_when_total_missing() {
            let models = [model(1, 1, 0.25, None), model(1, 1, 0.5, None)];
            let stats = aggregate_model_usage(&models, None, None, 200_000);
            assert!((stats.total_cost_usd - 0.75).abs() < f64::EPSILON);
        }

        #[test]
        fn turn_total_cost_wins() {
            let models = [model(1, 1, 0.25, None), model(1, 1, 0.5, None)];
            let stats = aggregate_model_usage(&models, None, Some(1.0), 200_000);
            assert_eq!(stats.total_cost_usd, 1.0);
        }

        #[test]
        fn context_window_is_max_reported() {
            let models = [model(1, 1, 0.0, Some(200_000)), model(1, 1, 0.0, Some(1_000_000))];
            let stats = aggregate_model_usage(&models, None, None, 128_000);
            assert_eq!(stats.context_window, 1_000_000);
        }

        #[test]
        fn falls_back_to_default_window() {
            let stats = aggregate_model_usage(&[model(1, 1, 0.0, None)], None, None, 128_000);
            assert_eq!(stats.context_window, 128_000);
        }

        #[test]
        fn uses_fallback_when_no_models() {
            let turn = model(500, 20, 0.0, None);
            let stats = aggregate_model_usage(&[], Some(&turn), Some(0.1), 200_000);
            assert_eq!(stats.input_tokens, 500);
            assert_eq!(stats.total_cost_usd, 0.1);
        }

        #[test]
        fn deserializes_claude_model_usage() {
            let usage: ModelUsage = serde_json::from_str(
                r#"{"inputTokens":10,"outputTokens":5,"cacheReadInputTokens":7,"costUSD":0.02,"contextWindow":200000,"webSearchRequests":0}"#,
            )
            .unwrap();
            assert_eq!(usage.cache_read_input_tokens, 7);
            assert_eq!(usage.cache_creation_input_tokens, 0);
            assert_eq!(usage.context_window, Some(200_000));
        }
    }

    mod estimate {
        use super::*;

        fn stats(input: u64, cache_read: u64, output: u64, window: u64) -> UsageStats {
            UsageStats {
                input_tokens: input,
                cache_read_input_tokens: cache_read,
                output_tokens: output,
                context_window: window,
                ..Default::default()
            }
        }

        #[test]
        fn default_formula_counts_cache_reads() {
            let s = stats(10_000, 40_000, 5_000, 100_000);
            assert_eq!(estimate_context_usage(&s, AgentKind::ClaudeCode), Some(50));
        }

        #[test]
        fn combined_formula_counts_output() {
            let s = stats(10_000, 40_000, 5_000, 100_000);
            assert_eq!(estimate_context_usage(&s, AgentKind::Codex), Some(15));
        }

        #[test]
        fn over_window_is_unknown() {
            let s = stats(150_000, 100_000, 0, 200_000);
            assert_eq!(estimate_context_usage(&s, AgentKind::ClaudeCode), None);
        }

        #[test]
        fn exactly_full_is_100() {
            let s = stats(200_000, 0, 0, 200_000);
            assert_eq!(estimate_context_usage(&s, AgentKind::ClaudeCode), Some(100));
        }

        #[test]
        fn zero_window_is_unknown() {
            let s = stats(1, 0, 0, 0);
            assert_eq!(estimate_context_usage(&s, AgentKind::ClaudeCode), None);
        }
    }
}
