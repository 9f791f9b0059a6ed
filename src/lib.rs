//! # Device Mock Bridge
//!
//! Queue-driven stand-ins for the native device APIs a sandboxed WASM guest links
//! against: an EVP-style device/cloud agent and a SensCord-style sensor stack.
//! The engine resolves the guest's imports against the symbol tables here and
//! hands every call, plus the guest's linear memory, to the matching mock.
//!
//! ## Architecture
//!
//! ```text
//! Driver (tests, ScenarioDriver)          Guest (bytecode engine thread)
//!     │                                        │
//!     │ inject / push_*                        │ EVP_* / senscord_* imports
//!     ▼                                        ▼
//! EventQueuePair ── outbound ──► poll ──► Dispatcher ──► GuestMemory
//!     ▲                                  (marshal, invoke, free)
//!     └──────── inbound log ◄── every guest call
//! ```
//!
//! ## Features
//!
//! - **Single sync point**: driver and guest only meet at the outbound queue
//! - **Registration tables**: the latest callback per operation family wins
//! - **Scoped marshalling**: payloads live in guest memory only for one callback
//! - **Cancellable polls**: a blocked poll can be interrupted from any thread
//! - **Call log**: every guest call is recorded for assertions

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod evp;
pub mod memory;
pub mod metrics;
pub mod senscord;
pub mod symbols;

// Re-export commonly used types
pub use bridge::{
    ApiCallRecord, CancelHandle, Dequeued, DispatchOutcome, EventQueuePair, PollStatus,
    Registration, RegistrationTable,
};
pub use config::BridgeConfig;
pub use driver::{Scenario, ScenarioDriver, ScenarioEvent};
pub use error::{BridgeError, MemoryError, Result};
pub use evp::{EvpApiCall, EvpEvent, EvpMock, OperationFamily};
pub use memory::{FunctionHandle, GuestAddr, GuestMemory, LinearMemory};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use senscord::{Frame, SenscordApiCall, SenscordMock, SensorEvent};
pub use symbols::{HostModule, NativeSymbol, WasmValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default log directive applied on top of `RUST_LOG`
const DEFAULT_DIRECTIVE: &str = "device_mock_bridge=debug";

/// Install a fmt subscriber filtered by `RUST_LOG` plus the crate's debug directive
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = DEFAULT_DIRECTIVE.parse() {
        filter = filter.add_directive(directive);
    }
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
