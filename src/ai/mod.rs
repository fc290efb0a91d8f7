//! LLM-backed article enrichment and the monitor that watches it.

pub mod analyzer;
pub mod client;
pub mod monitor;

pub use analyzer::{AnalysisSummary, AnalyzeError, Analyzer, Operation};
pub use client::{AnthropicClient, Completion, CompletionRequest, LlmClient, LlmError};
pub use monitor::{AiMonitor, Alert, AlertKind, CallOutcome, CallRecord, MonitorSettings, MonitorSnapshot, Severity};
