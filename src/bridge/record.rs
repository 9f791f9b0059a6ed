//! Inbound API-call records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable snapshot of one guest → host call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallRecord<C> {
    /// Position in the session's inbound log
    pub seq: u64,
    /// Owning session
    pub session: Uuid,
    /// Wall-clock time of the call
    pub at: DateTime<Utc>,
    /// The call and its arguments
    pub call: C,
}

impl<C> ApiCallRecord<C> {
    /// Stamp a call with its sequence number and the current time
    pub fn new(seq: u64, session: Uuid, call: C) -> Self {
        Self {
            seq,
            session,
            at: Utc::now(),
            call,
        }
    }
}
