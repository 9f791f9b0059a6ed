//! SensCord-style sensor mock.
//!
//! [`SenscordMock`] stands in for the sensor stack: a single stream that always
//! yields the configured input frame, image-property blocks, bounding-box
//! reporting and the send-data session. `SessSendData` completes synchronously:
//! the completion goes through the outbound queue and is dispatched before the
//! call returns, the way the guest SDK expects.

pub mod event;
pub mod host;
pub mod record;

use crate::bridge::{
    ApiCallRecord, CancelHandle, Dequeued, DispatchOutcome, EventQueuePair, RegistrationTable,
};
use crate::config::BridgeConfig;
use crate::error::{senscord_status, sess_status, BridgeError, MemoryError, Result};
use crate::memory::{
    FunctionHandle, GuestAddr, GuestMemory, GuestStruct, ImageProperty, RawData, RectangleRegion,
};
use crate::metrics::{BridgeMetrics, DispatchTimer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

pub use event::{SenscordFamily, SensorEvent};
pub use record::{Detection, SenscordApiCall};

/// Property key that carries an [`ImageProperty`] block
pub const IMAGE_PROPERTY_KEY: &str = "image_property";

/// Bytes per pixel of the mock's RGB frames
const BYTES_PER_PIXEL: u32 = 3;

/// Handle returned by `senscord_ub_create_stream`
const UB_STREAM_HANDLE: u64 = 1;

/// An RGB input frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wrap packed RGB pixels; the length must be `width * height * 3`
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as u64) * (height as u64) * (BYTES_PER_PIXEL as u64);
        if pixels.len() as u64 != expected {
            return Err(BridgeError::InvalidArgument(format!(
                "frame of {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// An all-black frame
    pub fn blank(width: u32, height: u32) -> Self {
        let len = (width as usize) * (height as usize) * (BYTES_PER_PIXEL as usize);
        Self {
            width,
            height,
            pixels: vec![0; len],
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB bytes
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn property(&self) -> ImageProperty {
        ImageProperty {
            width: self.width,
            height: self.height,
            stride_bytes: self.width.saturating_mul(BYTES_PER_PIXEL),
            pixel_format: 0,
        }
    }
}

/// One simulated sensor session
pub struct SenscordMock {
    config: BridgeConfig,
    queues: EventQueuePair<SensorEvent, SenscordApiCall>,
    registrations: RegistrationTable<SenscordFamily>,
    metrics: Arc<BridgeMetrics>,
    input: Frame,
    frames_served: AtomicU64,
    raw_data: Mutex<Option<GuestAddr>>,
}

impl SenscordMock {
    /// Create a session serving a blank frame of the configured size
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let session = Uuid::new_v4();
        info!(
            session = %session,
            width = config.frame_width,
            height = config.frame_height,
            "Creating SensCord mock session"
        );

        let input = Frame::blank(config.frame_width, config.frame_height);
        Ok(Self {
            config,
            queues: EventQueuePair::new(session),
            registrations: RegistrationTable::new(),
            metrics: Arc::new(BridgeMetrics::new()),
            input,
            frames_served: AtomicU64::new(0),
            raw_data: Mutex::new(None),
        })
    }

    /// Serve `frame` instead of the blank default
    pub fn with_input_frame(mut self, frame: Frame) -> Self {
        self.input = frame;
        self
    }

    /// Session identifier
    pub fn session_id(&self) -> Uuid {
        self.queues.session()
    }

    /// The frame every `get_frame` yields
    pub fn input_frame(&self) -> &Frame {
        &self.input
    }

    // ---- core and stream ----

    /// `senscord_core_init`: writes the core handle to `core_out`
    pub fn core_init(&self, arena: &mut dyn GuestMemory, core_out: GuestAddr) -> i32 {
        self.queues.log_inbound(SenscordApiCall::CoreInit);
        store_handle(arena, core_out, u64::from(self.config.client_handle))
    }

    /// `senscord_core_exit`
    pub fn core_exit(&self, core: u64) -> i32 {
        self.queues.log_inbound(SenscordApiCall::CoreExit { core });
        self.release_raw_data_on_exit();
        senscord_status::OK
    }

    /// `senscord_core_open_stream`: writes the stream handle to `stream_out`
    pub fn open_stream(
        &self,
        arena: &mut dyn GuestMemory,
        core: u64,
        stream_key: &str,
        stream_out: GuestAddr,
    ) -> i32 {
        self.queues.log_inbound(SenscordApiCall::OpenStream {
            core,
            stream_key: stream_key.to_string(),
        });
        store_handle(arena, stream_out, self.config.stream_handle)
    }

    /// `senscord_core_close_stream`
    pub fn close_stream(&self, core: u64, stream: u64) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::CloseStream { core, stream });
        senscord_status::OK
    }

    /// `senscord_stream_start`
    pub fn stream_start(&self, stream: u64) -> i32 {
        self.queues.log_inbound(SenscordApiCall::StreamStart { stream });
        senscord_status::OK
    }

    /// `senscord_stream_stop`
    pub fn stream_stop(&self, stream: u64) -> i32 {
        self.queues.log_inbound(SenscordApiCall::StreamStop { stream });
        senscord_status::OK
    }

    /// `senscord_stream_get_frame`: writes a fresh frame handle to `frame_out`
    pub fn get_frame(
        &self,
        arena: &mut dyn GuestMemory,
        stream: u64,
        frame_out: GuestAddr,
        timeout_ms: i32,
    ) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::GetFrame { stream, timeout_ms });
        let frame = self.frames_served.fetch_add(1, Ordering::Relaxed) + 1;
        store_handle(arena, frame_out, frame)
    }

    /// `senscord_stream_release_frame`: frees the raw-data buffer of the frame, if any
    pub fn release_frame(&self, arena: &mut dyn GuestMemory, stream: u64, frame: u64) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::ReleaseFrame { stream, frame });
        if let Some(addr) = self.raw_data.lock().take() {
            arena.free(addr);
        }
        senscord_status::OK
    }

    /// `senscord_stream_get_property`: fills image properties, other keys are accepted as-is
    pub fn get_property(
        &self,
        arena: &mut dyn GuestMemory,
        stream: u64,
        key: &str,
        value: GuestAddr,
        size: u32,
    ) -> i32 {
        self.queues.log_inbound(SenscordApiCall::GetProperty {
            stream,
            key: key.to_string(),
        });
        if key == IMAGE_PROPERTY_KEY {
            return self.store_image_property(arena, value, size);
        }
        senscord_status::OK
    }

    /// `senscord_stream_set_property`
    pub fn set_property(&self, stream: u64, key: &str, size: u32) -> i32 {
        self.queues.log_inbound(SenscordApiCall::SetProperty {
            stream,
            key: key.to_string(),
            size,
        });
        senscord_status::OK
    }

    /// `senscord_stream_register_frame_callback`
    pub fn register_frame_callback(
        &self,
        stream: u64,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(SenscordApiCall::RegisterFrameCallback {
            stream,
            callback,
            user_context,
        });
        self.registrations
            .register(SenscordFamily::Frame, callback, user_context);
        senscord_status::OK
    }

    /// `senscord_stream_unregister_frame_callback`
    pub fn unregister_frame_callback(&self, stream: u64) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::UnregisterFrameCallback { stream });
        self.registrations.unregister(SenscordFamily::Frame);
        senscord_status::OK
    }

    // ---- frame and channel ----

    /// `senscord_frame_get_channel`: the channel handle equals the frame handle
    pub fn get_channel(
        &self,
        arena: &mut dyn GuestMemory,
        frame: u64,
        channel_id: u32,
        channel_out: GuestAddr,
    ) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::GetChannel { frame, channel_id });
        store_handle(arena, channel_out, frame)
    }

    /// `senscord_channel_get_raw_data`
    ///
    /// Copies the input frame into a guest allocation and describes it in the
    /// `senscord_raw_data_t` at `raw_out`. The allocation lives until the frame is
    /// released or the next raw-data request.
    pub fn channel_get_raw_data(
        &self,
        arena: &mut dyn GuestMemory,
        channel: u64,
        raw_out: GuestAddr,
    ) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::GetRawData { channel });

        let mut current = self.raw_data.lock();
        if let Some(previous) = current.take() {
            arena.free(previous);
        }

        let size = self.input.pixels.len() as u32;
        let addr = arena.allocate(size);
        if addr.is_null() {
            warn!(size, "Cannot allocate frame in guest");
            return senscord_status::ERROR;
        }
        let raw = RawData {
            address: u64::from(addr.0),
            size,
            data_type: 0,
            timestamp: self.config.frame_timestamp_ns,
        };
        let written = match arena.write(addr, &self.input.pixels) {
            Ok(()) => raw.store(&mut *arena, raw_out),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                debug!(addr = %addr, size, "Frame copied into guest");
                *current = Some(addr);
                senscord_status::OK
            }
            Err(e) => {
                warn!(error = %e, "Cannot write raw data block");
                arena.free(addr);
                senscord_status::ERROR
            }
        }
    }

    /// `senscord_channel_get_property`
    pub fn channel_get_property(
        &self,
        arena: &mut dyn GuestMemory,
        channel: u64,
        key: &str,
        value: GuestAddr,
        size: u32,
    ) -> i32 {
        self.queues.log_inbound(SenscordApiCall::GetChannelProperty {
            channel,
            key: key.to_string(),
        });
        self.store_image_property(arena, value, size)
    }

    /// `frame_bbox`: records one detection
    pub fn frame_bbox(
        &self,
        arena: &mut dyn GuestMemory,
        image: GuestAddr,
        roi: GuestAddr,
        class: f32,
        score: f32,
    ) -> i32 {
        let region = match RectangleRegion::load(arena, roi) {
            Ok(region) => region,
            Err(e) => {
                warn!(image = %image, error = %e, "Unreadable bounding box");
                return senscord_status::ERROR;
            }
        };
        debug!(class, score, ?region, "Detection reported");
        self.queues.log_inbound(SenscordApiCall::FrameBbox(Detection {
            class,
            score,
            region,
        }));
        senscord_status::OK
    }

    // ---- output streams ----

    /// `senscord_ub_create_stream`
    pub fn ub_create_stream(
        &self,
        name: &str,
        width: u32,
        height: u32,
        stride_bytes: u32,
        pixel_format: &str,
    ) -> u64 {
        self.queues.log_inbound(SenscordApiCall::UbCreateStream {
            name: name.to_string(),
            width,
            height,
            stride_bytes,
            pixel_format: pixel_format.to_string(),
        });
        UB_STREAM_HANDLE
    }

    /// `senscord_ub_send_data`
    pub fn ub_send_data(&self, handle: u64, image: GuestAddr) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::UbSendData { handle, image });
        senscord_status::OK
    }

    /// `senscord_ub_destroy_stream`
    pub fn ub_destroy_stream(&self, handle: u64) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::UbDestroyStream { handle });
        senscord_status::OK
    }

    /// `senscord_memcpy`: copies out of a raw-data buffer into guest memory
    pub fn memcpy(&self, arena: &mut dyn GuestMemory, dst: GuestAddr, src: u64, size: u32) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::Memcpy { dst, src, size });
        match copy_within_guest(arena, dst, src, size) {
            Ok(()) => senscord_status::OK,
            Err(e) => {
                warn!(error = %e, "senscord_memcpy failed");
                senscord_status::ERROR
            }
        }
    }

    /// `senscord_get_last_error`
    pub fn get_last_error(&self) {
        self.queues.log_inbound(SenscordApiCall::GetLastError);
    }

    // ---- send-data session ----

    /// `SessInit`
    pub fn sess_init(&self) -> i32 {
        self.queues.log_inbound(SenscordApiCall::SessInit);
        sess_status::OK
    }

    /// `SessExit`
    pub fn sess_exit(&self) -> i32 {
        self.queues.log_inbound(SenscordApiCall::SessExit);
        sess_status::OK
    }

    /// `SessRegisterSendDataCallback`
    pub fn sess_register_send_data_callback(
        &self,
        callback: FunctionHandle,
        private_data: u32,
    ) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::SessRegisterSendDataCallback {
                callback,
                private_data,
            });
        self.registrations
            .register(SenscordFamily::SendData, callback, private_data);
        sess_status::OK
    }

    /// `SessUnregisterSendDataCallback`
    pub fn sess_unregister_send_data_callback(&self) -> i32 {
        self.queues
            .log_inbound(SenscordApiCall::SessUnregisterSendDataCallback);
        self.registrations.unregister(SenscordFamily::SendData);
        sess_status::OK
    }

    /// `SessSendData`: blocks until the completion callback has been dispatched
    #[instrument(skip(self, arena, payload), fields(session = %self.session_id(), len = payload.len()))]
    pub fn sess_send_data(
        &self,
        arena: &mut dyn GuestMemory,
        data: GuestAddr,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> i32 {
        self.queues.log_inbound(SenscordApiCall::SessSendData {
            data,
            payload,
            timestamp,
        });

        self.queues.enqueue_outbound(SensorEvent::SendDataCompleted {
            data,
            send_data_ret: sess_status::OK,
        });
        self.metrics.record_enqueue();
        self.metrics.record_poll();

        let timeout = Duration::from_millis(u64::from(self.config.send_data_timeout_ms));
        match self.queues.dequeue_outbound(timeout) {
            Dequeued::Event(event) => {
                self.dispatch(arena, &event);
                sess_status::OK
            }
            Dequeued::TimedOut => {
                warn!("Send-data completion never arrived");
                self.retract_completion(data);
                self.metrics.record_timeout();
                sess_status::OTHER
            }
            Dequeued::Cancelled => {
                debug!("Send-data wait cancelled");
                self.retract_completion(data);
                self.metrics.record_cancellation();
                sess_status::OTHER
            }
        }
    }

    /// Drop the completion a failed `SessSendData` left behind
    ///
    /// Otherwise the next call would dispatch this call's data pointer.
    fn retract_completion(&self, data: GuestAddr) {
        let stale = self.queues.retract_outbound(|event| {
            matches!(event, SensorEvent::SendDataCompleted { data: d, .. } if *d == data)
        });
        if stale.is_some() {
            trace!(data = data.0, "Retracted send-data completion");
        }
    }

    // ---- driver side ----

    /// Handle that interrupts a blocked `SessSendData`
    pub fn cancel_handle(&self) -> CancelHandle {
        self.queues.cancel_handle()
    }

    /// Inbound log, oldest first
    pub fn api_calls(&self) -> Vec<ApiCallRecord<SenscordApiCall>> {
        self.queues.inbound_snapshot()
    }

    /// Number of guest calls logged so far
    pub fn api_call_count(&self) -> usize {
        self.queues.inbound_len()
    }

    /// Block up to `timeout` for the guest call with sequence number `seq`
    pub fn wait_api_call(
        &self,
        seq: u64,
        timeout: Duration,
    ) -> Option<ApiCallRecord<SenscordApiCall>> {
        self.queues.wait_inbound(seq, timeout)
    }

    /// Outbound events not yet consumed
    pub fn pending_events(&self) -> usize {
        self.queues.pending()
    }

    /// Detections reported so far
    pub fn detections(&self) -> Vec<Detection> {
        self.api_calls()
            .into_iter()
            .filter_map(|record| match record.call {
                SenscordApiCall::FrameBbox(detection) => Some(detection),
                _ => None,
            })
            .collect()
    }

    /// Session metrics
    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    fn dispatch(&self, arena: &mut dyn GuestMemory, event: &SensorEvent) -> DispatchOutcome {
        let timer = DispatchTimer::start();
        let outcome = match (event, self.registrations.lookup(event.family())) {
            (
                SensorEvent::SendDataCompleted {
                    data,
                    send_data_ret,
                },
                Some(entry),
            ) if !entry.callback.is_null() => {
                let argv = [data.0, entry.user_context, *send_data_ret as u32];
                match arena.invoke_indirect(entry.callback, &argv) {
                    Ok(status) => DispatchOutcome::Invoked {
                        callback: entry.callback,
                        status,
                    },
                    Err(e) => DispatchOutcome::from_memory_error(entry.callback, e),
                }
            }
            _ => DispatchOutcome::NoListener,
        };
        self.metrics.record_dispatch(&outcome, timer.elapsed());

        match &outcome {
            DispatchOutcome::NoListener => {
                debug!(event = event.name(), "No listener registered, dropping event");
            }
            DispatchOutcome::Invoked { .. } => {
                debug!(event = event.name(), "Dispatched event");
            }
            failure => {
                warn!(event = event.name(), outcome = failure.label(), "Dispatch failed");
                self.queues.log_inbound(SenscordApiCall::DispatchDropped {
                    event: event.name().to_string(),
                    outcome: failure.clone(),
                });
            }
        }
        outcome
    }

    fn store_image_property(&self, arena: &mut dyn GuestMemory, value: GuestAddr, size: u32) -> i32 {
        if size < ImageProperty::SIZE {
            warn!(size, "Property block too small for image properties");
            return senscord_status::ERROR;
        }
        match self.input.property().store(arena, value) {
            Ok(()) => senscord_status::OK,
            Err(e) => {
                warn!(error = %e, "Cannot write image property block");
                senscord_status::ERROR
            }
        }
    }

    fn release_raw_data_on_exit(&self) {
        // the guest heap goes away with the instance; only forget the address
        if let Some(addr) = self.raw_data.lock().take() {
            debug!(addr = %addr, "Raw data still held at core exit");
        }
    }
}

fn copy_within_guest(
    arena: &mut dyn GuestMemory,
    dst: GuestAddr,
    src: u64,
    size: u32,
) -> std::result::Result<(), MemoryError> {
    let src = u32::try_from(src).map_err(|_| MemoryError::OutOfBounds {
        addr: GuestAddr(u32::MAX),
        len: size,
    })?;
    let bytes = arena.read(GuestAddr(src), size)?;
    arena.write(dst, &bytes)
}

fn store_handle(arena: &mut dyn GuestMemory, out: GuestAddr, handle: u64) -> i32 {
    if out.is_null() {
        return senscord_status::OK;
    }
    match arena.write(out, &handle.to_le_bytes()) {
        Ok(()) => senscord_status::OK,
        Err(e) => {
            warn!(error = %e, "Cannot write handle into guest");
            senscord_status::ERROR
        }
    }
}
