//! In-process metrics for the AI pipeline.
//!
//! Every LLM call is recorded into a bounded rolling window. Latency
//! percentiles, throughput and the alert checks read the window; call
//! counts, token totals and costs are cumulative since startup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::{LlmConfig, MonitorConfig};

/// Minimum samples before the error rate can raise an alert
const MIN_ERROR_RATE_SAMPLES: usize = 10;

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub window_size: usize,
    pub error_rate_threshold: f64,
    pub p95_latency_ms: u64,
    pub daily_cost_budget_usd: f64,
    pub repeated_error_threshold: usize,
    pub default_pricing: Pricing,
    pub model_pricing: HashMap<String, Pricing>,
}

impl MonitorSettings {
    pub fn from_config(monitor: &MonitorConfig, llm: &LlmConfig) -> Self {
        Self {
            window_size: monitor.window_size.max(1),
            error_rate_threshold: monitor.error_rate_threshold,
            p95_latency_ms: monitor.p95_latency_ms,
            daily_cost_budget_usd: monitor.daily_cost_budget_usd,
            repeated_error_threshold: monitor.repeated_error_threshold,
            default_pricing: Pricing {
                input_per_mtok: llm.input_price_per_mtok,
                output_per_mtok: llm.output_price_per_mtok,
            },
            model_pricing: HashMap::new(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default(), &LlmConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure { category: String },
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub operation: String,
    pub model: String,
    pub latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub outcome: CallOutcome,
    /// Unix seconds
    pub at: i64,
}

impl CallRecord {
    fn is_failure(&self) -> bool {
        matches!(self.outcome, CallOutcome::Failure { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct LatencyStats {
    pub samples: usize,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl LatencyStats {
    fn from_latencies(mut latencies: Vec<u64>) -> Self {
        latencies.sort_unstable();
        Self {
            samples: latencies.len(),
            p50_ms: percentile(&latencies, 50.0),
            p95_ms: percentile(&latencies, 95.0),
            p99_ms: percentile(&latencies, 99.0),
            max_ms: latencies.last().copied(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Failure ratio over the rolling window
    pub error_rate: f64,
    pub window_samples: usize,
    pub throughput_per_minute: f64,
    pub latency: LatencyStats,
    pub latency_by_operation: BTreeMap<String, LatencyStats>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub cost_today_usd: f64,
    pub cost_by_model: BTreeMap<String, f64>,
    pub errors_by_category: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighLatency,
    CostBudgetExceeded,
    RepeatedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Default)]
struct MonitorState {
    window: VecDeque<CallRecord>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost_usd: f64,
    cost_by_model: BTreeMap<String, f64>,
    cost_by_day: BTreeMap<String, f64>,
    errors_by_category: BTreeMap<String, u64>,
}

/// Shared AI call monitor; wrap in `Arc` and record from any task.
pub struct AiMonitor {
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
}

/// Days of per-day cost kept for budget checks
const COST_DAYS_RETAINED: usize = 7;

fn utc_day(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

fn severity(value: f64, threshold: f64) -> Severity {
    if threshold > 0.0 && value >= threshold * 2.0 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

impl AiMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // A panic while holding the lock leaves counters usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cost_for(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self
            .settings
            .model_pricing
            .get(model)
            .copied()
            .unwrap_or(self.settings.default_pricing);
        (input_tokens as f64 * pricing.input_per_mtok + output_tokens as f64 * pricing.output_per_mtok)
            / 1_000_000.0
    }

    pub fn record(&self, call: CallRecord) {
        let mut state = self.lock();

        state.total_calls += 1;
        state.total_input_tokens += call.input_tokens;
        state.total_output_tokens += call.output_tokens;
        state.total_cost_usd += call.cost_usd;
        *state.cost_by_model.entry(call.model.clone()).or_default() += call.cost_usd;
        *state.cost_by_day.entry(utc_day(call.at)).or_default() += call.cost_usd;
        while state.cost_by_day.len() > COST_DAYS_RETAINED {
            state.cost_by_day.pop_first();
        }

        match &call.outcome {
            CallOutcome::Success => state.successful_calls += 1,
            CallOutcome::Failure { category } => {
                state.failed_calls += 1;
                *state.errors_by_category.entry(category.clone()).or_default() += 1;
            }
        }

        if state.window.len() >= self.settings.window_size {
            state.window.pop_front();
        }
        state.window.push_back(call);
    }

    pub fn snapshot(&self, now: i64) -> MonitorSnapshot {
        let state = self.lock();

        let window_samples = state.window.len();
        let window_failures = state.window.iter().filter(|c| c.is_failure()).count();
        let error_rate = if window_samples == 0 {
            0.0
        } else {
            window_failures as f64 / window_samples as f64
        };

        // Calls per minute since the oldest call in the window, floored at one minute
        let throughput_per_minute = match state.window.front() {
            Some(oldest) => {
                let minutes = ((now - oldest.at).max(0) as f64 / 60.0).max(1.0);
                window_samples as f64 / minutes
            }
            None => 0.0,
        };

        let latency =
            LatencyStats::from_latencies(state.window.iter().map(|c| c.latency_ms).collect());
        let mut per_operation: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for call in &state.window {
            per_operation
                .entry(call.operation.clone())
                .or_default()
                .push(call.latency_ms);
        }
        let latency_by_operation = per_operation
            .into_iter()
            .map(|(op, latencies)| (op, LatencyStats::from_latencies(latencies)))
            .collect();

        MonitorSnapshot {
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            error_rate,
            window_samples,
            throughput_per_minute,
            latency,
            latency_by_operation,
            total_input_tokens: state.total_input_tokens,
            total_output_tokens: state.total_output_tokens,
            total_cost_usd: state.total_cost_usd,
            cost_today_usd: state.cost_by_day.get(&utc_day(now)).copied().unwrap_or(0.0),
            cost_by_model: state.cost_by_model.clone(),
            errors_by_category: state.errors_by_category.clone(),
        }
    }

    pub fn check_alerts(&self, now: i64) -> Vec<Alert> {
        let snapshot = self.snapshot(now);
        let settings = &self.settings;
        let mut alerts = Vec::new();

        if snapshot.window_samples >= MIN_ERROR_RATE_SAMPLES
            && snapshot.error_rate >= settings.error_rate_threshold
        {
            let severity = if snapshot.error_rate >= 0.5 {
                Severity::Critical
            } else {
                severity(snapshot.error_rate, settings.error_rate_threshold)
            };
            alerts.push(Alert {
                kind: AlertKind::HighErrorRate,
                severity,
                message: format!(
                    "AI error rate {:.1}% over the last {} calls",
                    snapshot.error_rate * 100.0,
                    snapshot.window_samples
                ),
                value: snapshot.error_rate,
                threshold: settings.error_rate_threshold,
            });
        }

        if let Some(p95) = snapshot.latency.p95_ms {
            if settings.p95_latency_ms > 0 && p95 >= settings.p95_latency_ms {
                alerts.push(Alert {
                    kind: AlertKind::HighLatency,
                    severity: severity(p95 as f64, settings.p95_latency_ms as f64),
                    message: format!("AI p95 latency {p95}ms"),
                    value: p95 as f64,
                    threshold: settings.p95_latency_ms as f64,
                });
            }
        }

        if settings.daily_cost_budget_usd > 0.0
            && snapshot.cost_today_usd >= settings.daily_cost_budget_usd
        {
            alerts.push(Alert {
                kind: AlertKind::CostBudgetExceeded,
                severity: severity(snapshot.cost_today_usd, settings.daily_cost_budget_usd),
                message: format!(
                    "AI spend today ${:.4} of ${:.2} budget",
                    snapshot.cost_today_usd, settings.daily_cost_budget_usd
                ),
                value: snapshot.cost_today_usd,
                threshold: settings.daily_cost_budget_usd,
            });
        }

        if let Some((category, streak)) = self.failure_streak() {
            let k = settings.repeated_error_threshold;
            if k > 0 && streak >= k {
                alerts.push(Alert {
                    kind: AlertKind::RepeatedError,
                    severity: severity(streak as f64, k as f64),
                    message: format!("Last {streak} AI calls failed with {category}"),
                    value: streak as f64,
                    threshold: k as f64,
                });
            }
        }

        if !alerts.is_empty() {
            tracing::debug!(count = alerts.len(), "AI monitor alerts active");
        }
        alerts
    }

    /// Category and length of the run of identical failures ending the window.
    fn failure_streak(&self) -> Option<(String, usize)> {
        let state = self.lock();
        let mut calls = state.window.iter().rev();
        let CallOutcome::Failure { category } = &calls.next()?.outcome else {
            return None;
        };
        let streak = 1 + calls
            .take_while(|c| matches!(&c.outcome, CallOutcome::Failure { category: c2 } if c2 == category))
            .count();
        Some((category.clone(), streak))
    }
}

impl Default for AiMonitor {
    fn default() -> Self {
        Self::new(MonitorSettings::default())
    }
}
