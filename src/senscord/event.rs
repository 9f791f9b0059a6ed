//! Sensor-side events and operation families.

use crate::memory::GuestAddr;
use serde::{Deserialize, Serialize};

/// Registration slots of the sensor domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SenscordFamily {
    /// `SessRegisterSendDataCallback`
    SendData,
    /// `senscord_stream_register_frame_callback`
    Frame,
}

/// One outbound event, sensor simulation → guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SensorEvent {
    /// A `SessSendData` transfer finished
    SendDataCompleted {
        /// Guest buffer that was sent
        data: GuestAddr,
        /// Session status of the transfer
        send_data_ret: i32,
    },
}

impl SensorEvent {
    /// Family whose registration this event is delivered to
    pub fn family(&self) -> SenscordFamily {
        match self {
            SensorEvent::SendDataCompleted { .. } => SenscordFamily::SendData,
        }
    }

    /// Tag name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            SensorEvent::SendDataCompleted { .. } => "SendDataCompleted",
        }
    }
}
