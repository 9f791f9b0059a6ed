//! Domain-independent bridge plumbing.
//!
//! Both mock domains are built from the same three pieces: an
//! [`EventQueuePair`] shared between the driver and the guest thread, a
//! [`RegistrationTable`] of guest callbacks, and [`ApiCallRecord`]s for the
//! inbound log. Dispatch outcomes and poll results are shared here too.

pub mod queue;
pub mod record;
pub mod registry;

use crate::error::{evp_status, MemoryError};
use crate::memory::FunctionHandle;
use serde::{Deserialize, Serialize};

pub use queue::{CancelHandle, Dequeued, EventQueuePair};
pub use record::ApiCallRecord;
pub use registry::{Registration, RegistrationTable};

/// What happened to one dequeued event
///
/// Failures never propagate to the guest; the poll still reports success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DispatchOutcome {
    /// The guest callback ran
    Invoked {
        /// Callback that ran
        callback: FunctionHandle,
        /// Its return value
        status: i32,
    },
    /// No callback is registered for the event's family (event dropped)
    NoListener,
    /// The marshal buffer could not be allocated (event dropped)
    AllocationFailed {
        /// Requested size
        len: u32,
    },
    /// The marshal buffer was allocated but the call failed
    InvocationFailed {
        /// Callback that failed
        callback: FunctionHandle,
        /// Failure description
        error: String,
    },
}

impl DispatchOutcome {
    /// Whether the guest callback ran
    pub fn is_invoked(&self) -> bool {
        matches!(self, DispatchOutcome::Invoked { .. })
    }

    /// Whether the event was lost to an internal failure (as opposed to having no listener)
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::AllocationFailed { .. } | DispatchOutcome::InvocationFailed { .. }
        )
    }

    /// Outcome for a failed indirect call, folding allocation failures into their own variant
    pub fn from_memory_error(callback: FunctionHandle, error: MemoryError) -> Self {
        match error {
            MemoryError::AllocationFailed { len } => DispatchOutcome::AllocationFailed { len },
            other => DispatchOutcome::InvocationFailed {
                callback,
                error: other.to_string(),
            },
        }
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Invoked { .. } => "invoked",
            DispatchOutcome::NoListener => "no_listener",
            DispatchOutcome::AllocationFailed { .. } => "allocation_failed",
            DispatchOutcome::InvocationFailed { .. } => "invocation_failed",
        }
    }
}

/// Result of one poll of the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollStatus {
    /// One event was consumed (dispatched or dropped)
    Ok,
    /// The queue stayed empty for the whole timeout
    TimedOut,
    /// Shutdown was requested, or the wait was cancelled
    ShouldExit,
}

impl PollStatus {
    /// The `EVP_RESULT` the guest observes
    pub fn as_evp_status(self) -> i32 {
        match self {
            PollStatus::Ok => evp_status::OK,
            PollStatus::TimedOut => evp_status::TIMEDOUT,
            PollStatus::ShouldExit => evp_status::SHOULDEXIT,
        }
    }
}
