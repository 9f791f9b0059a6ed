//! Inbound records of EVP guest calls.

use super::event::RpcId;
use crate::bridge::DispatchOutcome;
use crate::memory::{FunctionHandle, GuestAddr};
use serde::{Deserialize, Serialize};

/// One `EVP_telemetry_entry` (key/value pair of C strings)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    /// Telemetry key
    pub key: String,
    /// Telemetry value, usually JSON text
    pub value: String,
}

/// Arguments of one guest → host call, as seen by the mock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "camelCase")]
pub enum EvpApiCall {
    /// `EVP_initialize`
    Initialize,
    /// `EVP_getWorkspaceDirectory`
    GetWorkspaceDirectory {
        /// Client handle
        handle: u32,
        /// `EVP_WORKSPACE_TYPE`
        workspace_type: u32,
    },
    /// `EVP_processEvent`
    ProcessEvent {
        /// Client handle
        handle: u32,
        /// Timeout in milliseconds
        timeout_ms: u32,
    },
    /// `EVP_setConfigurationCallback`
    SetConfigurationCallback {
        /// Client handle
        handle: u32,
        /// Guest callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_setMessageCallback`
    SetMessageCallback {
        /// Client handle
        handle: u32,
        /// Guest callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_setRpcCallback`
    SetRpcCallback {
        /// Client handle
        handle: u32,
        /// Guest callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_sendState`
    SendState {
        /// Client handle
        handle: u32,
        /// State topic
        topic: String,
        /// State bytes
        payload: Vec<u8>,
        /// Acknowledgment callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_sendTelemetry`
    SendTelemetry {
        /// Client handle
        handle: u32,
        /// Decoded entries
        entries: Vec<TelemetryEntry>,
        /// Acknowledgment callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_sendMessage`
    SendMessage {
        /// Client handle
        handle: u32,
        /// Publication topic
        topic: String,
        /// Message bytes
        payload: Vec<u8>,
        /// Acknowledgment callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_sendRpcResponse`
    SendRpcResponse {
        /// Client handle
        handle: u32,
        /// Request being answered
        id: RpcId,
        /// Response text
        response: String,
        /// `EVP_RPC_RESPONSE_STATUS`
        status: u32,
        /// Acknowledgment callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `EVP_blobOperation`
    BlobOperation {
        /// Client handle
        handle: u32,
        /// `EVP_BLOB_TYPE`
        blob_type: u32,
        /// `EVP_BLOB_OPERATION`
        operation: u32,
        /// Guest address of the request block
        request: GuestAddr,
        /// URL read from the request block, if it could be decoded
        url: Option<String>,
        /// Guest address of the local store block
        local_store: GuestAddr,
        /// Completion callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// A dequeued event was lost to an internal failure
    DispatchDropped {
        /// Tag of the dropped event
        event: String,
        /// What went wrong
        outcome: DispatchOutcome,
    },
}

impl EvpApiCall {
    /// Whether this record describes a guest call (as opposed to a bridge diagnostic)
    pub fn is_guest_call(&self) -> bool {
        !matches!(self, EvpApiCall::DispatchDropped { .. })
    }
}
