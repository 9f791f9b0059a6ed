//! Inbound records of sensor guest calls.

use crate::bridge::DispatchOutcome;
use crate::memory::{FunctionHandle, GuestAddr, RectangleRegion};
use serde::{Deserialize, Serialize};

/// A bounding box reported by the guest through `frame_bbox`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Class index
    pub class: f32,
    /// Confidence
    pub score: f32,
    /// Box in pixel coordinates
    pub region: RectangleRegion,
}

/// Arguments of one guest → host call, as seen by the mock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "camelCase")]
pub enum SenscordApiCall {
    /// `senscord_core_init`
    CoreInit,
    /// `senscord_core_exit`
    CoreExit {
        /// Core handle
        core: u64,
    },
    /// `senscord_core_open_stream`
    OpenStream {
        /// Core handle
        core: u64,
        /// Stream key, e.g. "inference_stream"
        stream_key: String,
    },
    /// `senscord_core_close_stream`
    CloseStream {
        /// Core handle
        core: u64,
        /// Stream handle
        stream: u64,
    },
    /// `senscord_stream_start`
    StreamStart {
        /// Stream handle
        stream: u64,
    },
    /// `senscord_stream_stop`
    StreamStop {
        /// Stream handle
        stream: u64,
    },
    /// `senscord_stream_get_frame`
    GetFrame {
        /// Stream handle
        stream: u64,
        /// Timeout in milliseconds
        timeout_ms: i32,
    },
    /// `senscord_stream_release_frame`
    ReleaseFrame {
        /// Stream handle
        stream: u64,
        /// Frame handle
        frame: u64,
    },
    /// `senscord_stream_get_property`
    GetProperty {
        /// Stream handle
        stream: u64,
        /// Property key
        key: String,
    },
    /// `senscord_stream_set_property`
    SetProperty {
        /// Stream handle
        stream: u64,
        /// Property key
        key: String,
        /// Size of the value block
        size: u32,
    },
    /// `senscord_stream_register_frame_callback`
    RegisterFrameCallback {
        /// Stream handle
        stream: u64,
        /// Guest callback
        callback: FunctionHandle,
        /// Opaque user context
        user_context: u32,
    },
    /// `senscord_stream_unregister_frame_callback`
    UnregisterFrameCallback {
        /// Stream handle
        stream: u64,
    },
    /// `senscord_frame_get_channel`
    GetChannel {
        /// Frame handle
        frame: u64,
        /// Channel index
        channel_id: u32,
    },
    /// `senscord_channel_get_raw_data`
    GetRawData {
        /// Channel handle
        channel: u64,
    },
    /// `senscord_channel_get_property`
    GetChannelProperty {
        /// Channel handle
        channel: u64,
        /// Property key
        key: String,
    },
    /// `frame_bbox`
    FrameBbox(Detection),
    /// `senscord_ub_create_stream`
    UbCreateStream {
        /// Window or stream name
        name: String,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Row stride in bytes
        stride_bytes: u32,
        /// Pixel format name
        pixel_format: String,
    },
    /// `senscord_ub_send_data`
    UbSendData {
        /// Output stream handle
        handle: u64,
        /// Guest address of the image
        image: GuestAddr,
    },
    /// `senscord_ub_destroy_stream`
    UbDestroyStream {
        /// Output stream handle
        handle: u64,
    },
    /// `senscord_memcpy`
    Memcpy {
        /// Destination in guest memory
        dst: GuestAddr,
        /// Source address as handed out in a raw-data block
        src: u64,
        /// Byte count
        size: u32,
    },
    /// `senscord_get_last_error`
    GetLastError,
    /// `SessInit`
    SessInit,
    /// `SessExit`
    SessExit,
    /// `SessRegisterSendDataCallback`
    SessRegisterSendDataCallback {
        /// Guest callback
        callback: FunctionHandle,
        /// Opaque private data word
        private_data: u32,
    },
    /// `SessUnregisterSendDataCallback`
    SessUnregisterSendDataCallback,
    /// `SessSendData`
    SessSendData {
        /// Guest address of the data
        data: GuestAddr,
        /// Copy of the data
        payload: Vec<u8>,
        /// Capture timestamp
        timestamp: u64,
    },
    /// A dequeued event was lost to an internal failure
    DispatchDropped {
        /// Tag of the dropped event
        event: String,
        /// What went wrong
        outcome: DispatchOutcome,
    },
}
