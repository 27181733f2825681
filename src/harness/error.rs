//! Error taxonomy for Open Harness.
//!
//! Two tiers:
//!
//! - [`HarnessError`] covers setup-time and infrastructure failures returned
//!   from [`crate::harness::run_workflow`] itself (not every run outcome —
//!   see [`RunFailure`]/[`AbortReason`] for the terminal statuses a run can
//!   reach while still returning `Ok`).
//! - External collaborators ([`crate::harness::agent::ExecutionAdapter`],
//!   [`crate::harness::recorder::RecordingStore`]) return a looser
//!   `Box<dyn Error + Send + Sync>`, since they are implementation-defined
//!   seams the harness only ever calls through an interface.

use thiserror::Error;

/// A boxed, thread-safe error from an external collaborator (adapter or store).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fatal setup or infrastructure errors surfaced directly from
/// [`crate::harness::run_workflow`].
///
/// These are distinct from the terminal run statuses ([`RunFailure`],
/// [`AbortReason`]) carried inside a successfully-returned [`crate::harness::RunOutcome`] —
/// a `HarnessError` means the run could not even be attempted or its
/// bookkeeping is unrecoverable.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// `recording.mode == Record` was requested without a backing store.
    #[error("a recording store is required when recording mode is `record`")]
    RecordingStoreRequired,

    /// `recording.mode == Replay` was requested without both a store and a recording id.
    #[error("both a recording store and a recording id are required when recording mode is `replay`")]
    ReplayRequiresRecordingId,

    /// The recording store rejected a lookup or append outside of a live run
    /// (e.g. loading a recording to replay).
    #[error("recording store error: {0}")]
    Store(#[source] BoxError),

    /// The requested recording does not exist.
    #[error("recording `{0}` not found")]
    RecordingNotFound(String),

    /// A named checkpoint was requested for partial replay but the loaded
    /// recording has no checkpoint by that name.
    #[error("checkpoint `{0}` not found in recording `{1}`")]
    CheckpointNotFound(String, String),
}

/// Why an agent's reducer or the recording store caused the run to become
/// `failed`. Both are fatal and immediate: a reducer panic is reported on
/// an `error:reducer` signal, and either one ends the run as `Failed`.
#[derive(Debug, Clone, Error)]
pub enum RunFailure {
    /// A registered reducer panicked while folding a signal into state.
    #[error("reducer for signal `{signal_name}` (id {signal_id}) failed: {message}")]
    ReducerFailed {
        signal_id: u64,
        signal_name: String,
        message: String,
    },

    /// The recording store rejected an append; determinism can no longer be
    /// guaranteed so the run cannot continue.
    #[error("recording store append failed: {0}")]
    StoreAppendFailed(String),

    /// Replay produced a signal name that disagrees with what the live
    /// agent-matching logic would have emitted at this point in the log.
    #[error("replay diverged at index {index}: expected `{expected}`, got `{actual}`")]
    ReplayDivergence {
        index: u64,
        expected: String,
        actual: String,
    },
}

/// Why a run was aborted (as opposed to failing outright).
#[derive(Debug, Clone, Error)]
pub enum AbortReason {
    /// `activations` reached `maxActivations`.
    #[error("activation budget exhausted ({activations}/{max_activations})")]
    BudgetExhausted {
        activations: usize,
        max_activations: usize,
    },

    /// [`crate::harness::hub::Hub::cancel`] was called explicitly.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The run's optional deadline (`HarnessConfig::run_deadline`) elapsed.
    #[error("run deadline exceeded")]
    Timeout,
}

/// The terminal state a run reaches, carried inside [`crate::harness::RunOutcome`]
/// rather than as an `Err` — every run returns a terminal status, the final
/// state, and the full in-memory signal stream, whether it completed,
/// aborted, or failed.
#[derive(Debug, Clone)]
pub enum TerminalStatus {
    /// `endWhen(state)` returned true, or the run reached quiescence.
    Complete,
    /// Budget exhaustion, cancellation, or timeout.
    Aborted(AbortReason),
    /// A reducer panicked, the store failed to append, or replay diverged.
    Failed(RunFailure),
}

impl TerminalStatus {
    /// Exit code for an embedding CLI.
    ///
    /// The core itself has no process boundary; this is provided purely as
    /// a convenience so an embedder can derive a process exit code from the
    /// run outcome without re-deriving its own mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminalStatus::Complete => 0,
            TerminalStatus::Failed(RunFailure::ReplayDivergence { .. }) => 4,
            TerminalStatus::Failed(_) => 1,
            TerminalStatus::Aborted(AbortReason::BudgetExhausted { .. }) => 3,
            TerminalStatus::Aborted(_) => 2,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TerminalStatus::Complete)
    }
}
