// src/lib.rs

//! Open Harness: a reactive runtime for multi-agent workflows.
//!
//! Agents are declarative templates that activate on pattern-matched
//! signals, optionally fold their output into a shared, versioned state
//! projection, and can be deterministically recorded and replayed. See
//! [`harness`] for the full module tree.

pub mod harness;

// Re-exported at the crate root for convenient external access.
pub use harness::{
    AgentDefinition, AgentDefinitionBuilder, ExecutionAdapter, HarnessConfig, HarnessError, Hub,
    HubBuilder, RecordingMode, RunFailure, RunOutcome, RunRequest, RunState, Signal, StateStore,
    TerminalStatus, WorkflowState, run_workflow,
};
