//! EVP event taxonomy.

use crate::memory::{BlobResultEvp, FunctionHandle};
use serde::{Deserialize, Serialize};

/// Identifier of an RPC request (`EVP_RPC_ID`)
pub type RpcId = u64;

/// `EVP_*_CALLBACK_REASON` values passed to acknowledgment callbacks
pub mod reason {
    /// State, telemetry, message and RPC response delivered
    pub const SENT: u32 = 0;
    /// Previous state update replaced by a newer one
    pub const STATE_OVERWRITTEN: u32 = 1;
    /// Telemetry, message or RPC response failed
    pub const ERROR: u32 = 1;
    /// State update abandoned because the module is exiting
    pub const STATE_EXIT: u32 = 2;
    /// Blob transfer finished
    pub const BLOB_DONE: u32 = 0;
    /// Blob transfer abandoned because the module is exiting
    pub const BLOB_EXIT: u32 = 1;
}

/// A logical API area with its own registration slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationFamily {
    /// `EVP_sendState`
    State,
    /// `EVP_sendTelemetry`
    Telemetry,
    /// `EVP_setConfigurationCallback`
    Configuration,
    /// `EVP_setMessageCallback`
    Message,
    /// `EVP_sendMessage`
    SendMessage,
    /// `EVP_setRpcCallback`
    Rpc,
    /// `EVP_sendRpcResponse`
    RpcResponse,
    /// `EVP_blobOperation`
    Blob,
}

/// One outbound event, host simulation → guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EvpEvent {
    /// A state update was delivered
    StateDelivered {
        /// `EVP_*_CALLBACK_REASON`
        reason: u32,
        /// Callback supplied by the send call
        callback: FunctionHandle,
        /// User context supplied by the send call
        user_context: u32,
    },
    /// A telemetry batch was delivered
    TelemetryDelivered {
        /// `EVP_*_CALLBACK_REASON`
        reason: u32,
        /// Callback supplied by the send call
        callback: FunctionHandle,
        /// User context supplied by the send call
        user_context: u32,
    },
    /// An outgoing message was sent
    MessageSent {
        /// `EVP_*_CALLBACK_REASON`
        reason: u32,
        /// Callback supplied by the send call
        callback: FunctionHandle,
        /// User context supplied by the send call
        user_context: u32,
    },
    /// An RPC response was sent
    RpcResponseSent {
        /// `EVP_*_CALLBACK_REASON`
        reason: u32,
        /// Callback supplied by the send call
        callback: FunctionHandle,
        /// User context supplied by the send call
        user_context: u32,
    },
    /// Remote configuration for `topic`
    ConfigurationPushed {
        /// Configuration topic
        topic: String,
        /// Raw configuration bytes
        payload: Vec<u8>,
    },
    /// Incoming message on `topic`
    MessageReceived {
        /// Subscription topic
        topic: String,
        /// Raw message bytes
        payload: Vec<u8>,
    },
    /// Incoming RPC request
    RpcRequestPushed {
        /// Request identifier, echoed back in the response
        id: RpcId,
        /// Method name
        method: String,
        /// Parameters, usually JSON text
        params: String,
    },
    /// A blob transfer finished
    BlobOperationDone {
        /// `EVP_BLOB_CALLBACK_REASON`
        reason: u32,
        /// Transfer result block
        result: BlobResultEvp,
        /// Callback supplied by the blob operation
        callback: FunctionHandle,
        /// User context supplied by the blob operation
        user_context: u32,
    },
    /// The guest's poll loop should exit
    ShutdownRequested,
}

impl EvpEvent {
    /// Family whose registration this event is delivered to
    pub fn family(&self) -> Option<OperationFamily> {
        match self {
            EvpEvent::StateDelivered { .. } => Some(OperationFamily::State),
            EvpEvent::TelemetryDelivered { .. } => Some(OperationFamily::Telemetry),
            EvpEvent::MessageSent { .. } => Some(OperationFamily::SendMessage),
            EvpEvent::MessageReceived { .. } => Some(OperationFamily::Message),
            EvpEvent::RpcResponseSent { .. } => Some(OperationFamily::RpcResponse),
            EvpEvent::ConfigurationPushed { .. } => Some(OperationFamily::Configuration),
            EvpEvent::RpcRequestPushed { .. } => Some(OperationFamily::Rpc),
            EvpEvent::BlobOperationDone { .. } => Some(OperationFamily::Blob),
            EvpEvent::ShutdownRequested => None,
        }
    }

    /// Tag name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            EvpEvent::StateDelivered { .. } => "StateDelivered",
            EvpEvent::TelemetryDelivered { .. } => "TelemetryDelivered",
            EvpEvent::MessageSent { .. } => "MessageSent",
            EvpEvent::RpcResponseSent { .. } => "RpcResponseSent",
            EvpEvent::ConfigurationPushed { .. } => "ConfigurationPushed",
            EvpEvent::MessageReceived { .. } => "MessageReceived",
            EvpEvent::RpcRequestPushed { .. } => "RpcRequestPushed",
            EvpEvent::BlobOperationDone { .. } => "BlobOperationDone",
            EvpEvent::ShutdownRequested => "ShutdownRequested",
        }
    }

    /// Whether this is the terminal shutdown signal
    pub fn is_shutdown(&self) -> bool {
        matches!(self, EvpEvent::ShutdownRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families() {
        let ack = EvpEvent::StateDelivered {
            reason: reason::SENT,
            callback: FunctionHandle(1),
            user_context: 0,
        };
        assert_eq!(ack.family(), Some(OperationFamily::State));

        let received = EvpEvent::MessageReceived {
            topic: "t".into(),
            payload: vec![],
        };
        assert_eq!(received.family(), Some(OperationFamily::Message));
        assert_eq!(EvpEvent::ShutdownRequested.family(), None);
        assert!(EvpEvent::ShutdownRequested.is_shutdown());
    }

    #[test]
    fn test_serde_tagging() {
        let event = EvpEvent::RpcRequestPushed {
            id: 7,
            method: "reboot".into(),
            params: "{}".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rpcRequestPushed");
        assert_eq!(json["method"], "reboot");

        let back: EvpEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
