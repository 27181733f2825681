//! Runtime configuration.
//!
//! A plain struct plus a `Default` impl — no file-format parsing dependency
//! is pulled in, only in-process tunables an embedder sets before calling
//! [`crate::harness::run_workflow`].

use std::time::Duration;

/// Tunables for one [`crate::harness::run_workflow`] call.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Global cap on agent activations for the run. Defaults to a
    /// conservative value rather than "unbounded" so a misconfigured guard
    /// can't spin a run forever.
    pub max_activations: usize,
    /// Fallback `maxActivations` for an [`AgentDefinition`](crate::harness::agent::AgentDefinition)
    /// that does not declare its own per-agent cap.
    pub per_agent_default_max_activations: Option<usize>,
    /// Directory `JsonlRecordingStore` writes under, when no store is
    /// supplied explicitly.
    pub recording_dir: std::path::PathBuf,
    /// Optional wall-clock budget for the whole run; exceeding it aborts
    /// with `AbortReason::Timeout`.
    pub run_deadline: Option<Duration>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_activations: 100,
            per_agent_default_max_activations: None,
            recording_dir: std::path::PathBuf::from("./recordings"),
            run_deadline: None,
        }
    }
}
