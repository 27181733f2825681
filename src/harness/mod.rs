//! Open Harness: a reactive orchestration runtime for multi-agent
//! workflows, built around an immutable signal bus, a folded state
//! projection, pluggable agent execution, and deterministic
//! recording/replay.

pub mod agent;
pub mod config;
pub mod error;
pub mod hub;
pub mod recorder;
pub mod replay;
pub mod scheduler;
pub mod signal;
pub mod state;

pub use agent::{
    ActivationRequest, AdapterOutcome, AgentDefinition, AgentDefinitionBuilder, ExecutionAdapter,
    Guard, IntermediateSignal, IntermediateStream, ScriptedAdapter, ScriptedResponse,
};
pub use config::HarnessConfig;
pub use error::{AbortReason, BoxError, HarnessError, RunFailure, TerminalStatus};
pub use hub::{EmitRejected, Hub, HubBuilder, RunState, SubscriptionHandle};
pub use recorder::{
    InMemoryRecordingStore, JsonlRecordingStore, ListFilter, LoadSignalsFilter, RecordedSignal,
    RecordingMeta, RecordingMetadata, RecordingStore,
};
pub use replay::ReplayDriver;
pub use scheduler::{run_workflow, EndWhen, RecordingMode, RunMetrics, RunOutcome, RunRequest};
pub use signal::{pattern_matches, EmitContext, Payload, Signal};
pub use state::{ApplyOutcome, Reducer, StateChange, StateDraft, StateStore, WorkflowState};
