//! Error types for the mock bridge.
//!
//! Host-side failures use [`BridgeError`]. The guest never sees these: across the
//! guest-call boundary the bridge only speaks the integer status codes defined in
//! [`evp_status`], [`senscord_status`] and [`sess_status`].

use crate::memory::{FunctionHandle, GuestAddr};

/// Errors raised by the guest memory arena
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The arena could not satisfy an allocation
    #[error("Guest allocation of {len} bytes failed")]
    AllocationFailed {
        /// Requested length
        len: u32,
    },

    /// An access fell outside guest linear memory
    #[error("Guest access out of bounds: {len} bytes at {addr}")]
    OutOfBounds {
        /// Start address
        addr: GuestAddr,
        /// Access length
        len: u32,
    },

    /// A free of an address that is not a live allocation
    #[error("Invalid free of guest address {0}")]
    InvalidFree(GuestAddr),

    /// The function handle does not resolve to a guest function
    #[error("Invalid guest function handle {0}")]
    InvalidHandle(FunctionHandle),

    /// The guest trapped during an indirect call
    #[error("Guest trapped: {0}")]
    Trap(String),
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Guest memory error
    #[error("Guest memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Guest linked against a symbol this module does not provide
    #[error("Unknown native symbol '{symbol}' in module '{module}'")]
    UnknownSymbol {
        /// Module name (e.g. "env")
        module: String,
        /// Symbol name
        symbol: String,
    },

    /// Malformed signature string or argument vector
    #[error("Signature error: {0}")]
    Signature(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// General error
    #[error("{0}")]
    General(String),
}

impl BridgeError {
    /// Map to the EVP status code a guest would observe for this failure
    pub fn to_evp_status(&self) -> i32 {
        match self {
            BridgeError::Memory(MemoryError::AllocationFailed { .. }) => evp_status::NOMEM,
            BridgeError::Memory(MemoryError::OutOfBounds { .. }) => evp_status::FAULT,
            BridgeError::InvalidArgument(_) | BridgeError::Signature(_) => evp_status::INVAL,
            _ => evp_status::ERROR,
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::General(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::General(s.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// `EVP_RESULT` values returned to the guest
pub mod evp_status {
    /// Success
    pub const OK: i32 = 0;
    /// The module instance should exit its main loop
    pub const SHOULDEXIT: i32 = 1;
    /// No event arrived within the timeout
    pub const TIMEDOUT: i32 = 2;
    /// Generic error
    pub const ERROR: i32 = 3;
    /// Invalid parameter
    pub const INVAL: i32 = 4;
    /// Out of memory
    pub const NOMEM: i32 = 5;
    /// Payload too large
    pub const TOOBIG: i32 = 6;
    /// Try again
    pub const AGAIN: i32 = 7;
    /// Protocol error with the agent
    pub const AGENT_PROTOCOL_ERROR: i32 = 8;
    /// Already exists
    pub const EXIST: i32 = 9;
    /// Bad address
    pub const FAULT: i32 = 10;
}

/// SensCord C API status values
pub mod senscord_status {
    /// Success
    pub const OK: i32 = 0;
    /// Failure (details via `senscord_get_last_error`)
    pub const ERROR: i32 = -1;
}

/// Send-data session status values
pub mod sess_status {
    /// Success
    pub const OK: i32 = 0;
    /// Other error
    pub const OTHER: i32 = 1;
    /// Invalid parameter
    pub const INVALID_PARAM: i32 = 2;
    /// Stream is not running
    pub const NOT_STREAMING: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_error_display() {
        let err = MemoryError::AllocationFailed { len: 64 };
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn test_bridge_error_status_mapping() {
        let nomem = BridgeError::Memory(MemoryError::AllocationFailed { len: 8 });
        assert_eq!(nomem.to_evp_status(), evp_status::NOMEM);

        let fault = BridgeError::Memory(MemoryError::OutOfBounds {
            addr: GuestAddr(4),
            len: 4,
        });
        assert_eq!(fault.to_evp_status(), evp_status::FAULT);

        let inval = BridgeError::InvalidArgument("bad".into());
        assert_eq!(inval.to_evp_status(), evp_status::INVAL);

        assert_eq!(BridgeError::from("x").to_evp_status(), evp_status::ERROR);
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: BridgeError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, BridgeError::Serialization(_)));
    }
}
