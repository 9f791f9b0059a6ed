//! EVP-style device/cloud mock.
//!
//! [`EvpMock`] plays the device agent for one guest session. The guest calls
//! in through the `EVP_*` operations (usually via [`crate::symbols::HostModule`]);
//! the driver injects cloud-side events; the guest's `EVP_processEvent` loop
//! pulls them one at a time and the [`Dispatcher`] delivers them.

pub mod dispatch;
pub mod event;
pub mod host;
pub mod record;

use crate::bridge::{
    ApiCallRecord, CancelHandle, Dequeued, EventQueuePair, PollStatus, Registration,
    RegistrationTable,
};
use crate::config::BridgeConfig;
use crate::error::{evp_status, Result};
use crate::memory::{nul_terminated, BlobResultEvp, FunctionHandle, GuestAddr, GuestMemory};
use crate::metrics::{BridgeMetrics, DispatchTimer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use dispatch::Dispatcher;
pub use event::{reason, EvpEvent, OperationFamily, RpcId};
pub use record::{EvpApiCall, TelemetryEntry};

/// Arguments of `EVP_blobOperation` besides the handle and callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRequest {
    /// `EVP_BLOB_TYPE`
    pub blob_type: u32,
    /// `EVP_BLOB_OPERATION`
    pub operation: u32,
    /// Guest address of the request block
    pub request: GuestAddr,
    /// URL decoded from the request block
    pub url: Option<String>,
    /// Guest address of the local store block
    pub local_store: GuestAddr,
}

/// One simulated EVP agent session
pub struct EvpMock {
    config: BridgeConfig,
    queues: EventQueuePair<EvpEvent, EvpApiCall>,
    registrations: RegistrationTable<OperationFamily>,
    metrics: Arc<BridgeMetrics>,
}

impl EvpMock {
    /// Create a session with a validated configuration
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let session = Uuid::new_v4();
        info!(
            session = %session,
            client_handle = config.client_handle,
            "Creating EVP mock session"
        );

        Ok(Self {
            config,
            queues: EventQueuePair::new(session),
            registrations: RegistrationTable::new(),
            metrics: Arc::new(BridgeMetrics::new()),
        })
    }

    /// Session identifier
    pub fn session_id(&self) -> Uuid {
        self.queues.session()
    }

    /// Session configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ---- guest operations ----

    /// `EVP_initialize`: returns the client handle
    pub fn initialize(&self) -> u32 {
        self.queues.log_inbound(EvpApiCall::Initialize);
        self.config.client_handle
    }

    /// `EVP_getWorkspaceDirectory`
    ///
    /// The path is allocated inside the guest and ownership passes to it.
    /// Returns [`GuestAddr::NULL`] if the guest heap cannot hold it.
    pub fn get_workspace_directory(
        &self,
        arena: &mut dyn GuestMemory,
        handle: u32,
        workspace_type: u32,
    ) -> GuestAddr {
        self.queues.log_inbound(EvpApiCall::GetWorkspaceDirectory {
            handle,
            workspace_type,
        });

        let path = nul_terminated(&self.config.workspace_directory());
        let addr = arena.allocate(path.len() as u32);
        if addr.is_null() {
            warn!(len = path.len(), "Cannot allocate workspace path in guest");
            return GuestAddr::NULL;
        }
        if let Err(e) = arena.write(addr, &path) {
            warn!(error = %e, "Cannot write workspace path into guest");
            arena.free(addr);
            return GuestAddr::NULL;
        }
        addr
    }

    /// `EVP_processEvent`
    pub fn process_event(&self, arena: &mut dyn GuestMemory, handle: u32, timeout_ms: u32) -> i32 {
        self.poll(arena, handle, timeout_ms).as_evp_status()
    }

    /// Process at most one event, waiting up to `timeout_ms` for it
    #[instrument(skip(self, arena), fields(session = %self.session_id()))]
    pub fn poll(&self, arena: &mut dyn GuestMemory, handle: u32, timeout_ms: u32) -> PollStatus {
        self.queues
            .log_inbound(EvpApiCall::ProcessEvent { handle, timeout_ms });
        self.metrics.record_poll();

        let event = match self
            .queues
            .dequeue_outbound(Duration::from_millis(u64::from(timeout_ms)))
        {
            Dequeued::Event(event) => event,
            Dequeued::TimedOut => {
                self.metrics.record_timeout();
                return PollStatus::TimedOut;
            }
            Dequeued::Cancelled => {
                debug!("Poll cancelled");
                self.metrics.record_cancellation();
                return PollStatus::ShouldExit;
            }
        };

        if event.is_shutdown() {
            // leave the signal in place for every other poller
            self.queues.enqueue_outbound(EvpEvent::ShutdownRequested);
            self.metrics.record_shutdown();
            debug!("Shutdown observed");
            return PollStatus::ShouldExit;
        }

        let timer = DispatchTimer::start();
        let outcome = Dispatcher::new(&self.registrations).dispatch(arena, &event);
        self.metrics.record_dispatch(&outcome, timer.elapsed());
        if outcome.is_failure() {
            self.queues.log_inbound(EvpApiCall::DispatchDropped {
                event: event.name().to_string(),
                outcome,
            });
        }
        PollStatus::Ok
    }

    /// `EVP_setConfigurationCallback`
    pub fn set_configuration_callback(
        &self,
        handle: u32,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SetConfigurationCallback {
            handle,
            callback,
            user_context,
        });
        self.register(OperationFamily::Configuration, callback, user_context);
        evp_status::OK
    }

    /// `EVP_setMessageCallback`
    pub fn set_message_callback(
        &self,
        handle: u32,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SetMessageCallback {
            handle,
            callback,
            user_context,
        });
        self.register(OperationFamily::Message, callback, user_context);
        evp_status::OK
    }

    /// `EVP_setRpcCallback`
    pub fn set_rpc_callback(&self, handle: u32, callback: FunctionHandle, user_context: u32) -> i32 {
        self.queues.log_inbound(EvpApiCall::SetRpcCallback {
            handle,
            callback,
            user_context,
        });
        self.register(OperationFamily::Rpc, callback, user_context);
        evp_status::OK
    }

    /// `EVP_sendState`: acknowledged on the next poll
    pub fn send_state(
        &self,
        handle: u32,
        topic: &str,
        payload: &[u8],
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SendState {
            handle,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            callback,
            user_context,
        });
        self.register(OperationFamily::State, callback, user_context);
        self.inject(EvpEvent::StateDelivered {
            reason: reason::SENT,
            callback,
            user_context,
        });
        evp_status::OK
    }

    /// `EVP_sendTelemetry`: acknowledged on the next poll
    pub fn send_telemetry(
        &self,
        handle: u32,
        entries: Vec<TelemetryEntry>,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SendTelemetry {
            handle,
            entries,
            callback,
            user_context,
        });
        self.register(OperationFamily::Telemetry, callback, user_context);
        self.inject(EvpEvent::TelemetryDelivered {
            reason: reason::SENT,
            callback,
            user_context,
        });
        evp_status::OK
    }

    /// `EVP_sendMessage`: acknowledged on the next poll
    pub fn send_message(
        &self,
        handle: u32,
        topic: &str,
        payload: &[u8],
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SendMessage {
            handle,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            callback,
            user_context,
        });
        self.register(OperationFamily::SendMessage, callback, user_context);
        self.inject(EvpEvent::MessageSent {
            reason: reason::SENT,
            callback,
            user_context,
        });
        evp_status::OK
    }

    /// `EVP_sendRpcResponse`: acknowledged on the next poll
    pub fn send_rpc_response(
        &self,
        handle: u32,
        id: RpcId,
        response: &str,
        status: u32,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::SendRpcResponse {
            handle,
            id,
            response: response.to_string(),
            status,
            callback,
            user_context,
        });
        self.register(OperationFamily::RpcResponse, callback, user_context);
        self.inject(EvpEvent::RpcResponseSent {
            reason: reason::SENT,
            callback,
            user_context,
        });
        evp_status::OK
    }

    /// `EVP_blobOperation`: completes successfully on the next poll
    pub fn blob_operation(
        &self,
        handle: u32,
        request: BlobRequest,
        callback: FunctionHandle,
        user_context: u32,
    ) -> i32 {
        self.queues.log_inbound(EvpApiCall::BlobOperation {
            handle,
            blob_type: request.blob_type,
            operation: request.operation,
            request: request.request,
            url: request.url,
            local_store: request.local_store,
            callback,
            user_context,
        });
        self.register(OperationFamily::Blob, callback, user_context);
        self.inject(EvpEvent::BlobOperationDone {
            reason: reason::BLOB_DONE,
            result: BlobResultEvp::success(),
            callback,
            user_context,
        });
        evp_status::OK
    }

    /// Ask every poller of this session to exit
    ///
    /// A driver action, so nothing is added to the guest call log.
    pub fn request_shutdown(&self) {
        info!(session = %self.session_id(), "Shutdown requested");
        self.inject(EvpEvent::ShutdownRequested);
    }

    // ---- driver side ----

    /// Append an event to the outbound queue
    pub fn inject(&self, event: EvpEvent) {
        debug!(event = event.name(), "Injecting event");
        self.queues.enqueue_outbound(event);
        self.metrics.record_enqueue();
    }

    /// Simulate a configuration push from the cloud
    pub fn push_configuration(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.inject(EvpEvent::ConfigurationPushed {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    /// Simulate an incoming message
    pub fn push_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.inject(EvpEvent::MessageReceived {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    /// Simulate an incoming RPC request
    pub fn push_rpc_request(&self, id: RpcId, method: impl Into<String>, params: impl Into<String>) {
        self.inject(EvpEvent::RpcRequestPushed {
            id,
            method: method.into(),
            params: params.into(),
        });
    }

    /// Handle that interrupts a blocked poll
    pub fn cancel_handle(&self) -> CancelHandle {
        self.queues.cancel_handle()
    }

    /// Events not yet consumed by the guest
    pub fn pending_events(&self) -> usize {
        self.queues.pending()
    }

    /// Inbound log, oldest first
    pub fn api_calls(&self) -> Vec<ApiCallRecord<EvpApiCall>> {
        self.queues.inbound_snapshot()
    }

    /// Number of entries in the inbound log
    pub fn api_call_count(&self) -> usize {
        self.queues.inbound_len()
    }

    /// Block up to `timeout` for the inbound record with sequence number `seq`
    ///
    /// Lets a driver thread react to guest calls without polling the log.
    pub fn wait_api_call(&self, seq: u64, timeout: Duration) -> Option<ApiCallRecord<EvpApiCall>> {
        self.queues.wait_inbound(seq, timeout)
    }

    /// Current registration for `family`
    pub fn registration(&self, family: OperationFamily) -> Option<Registration> {
        self.registrations.lookup(family)
    }

    /// Session metrics
    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    fn register(&self, family: OperationFamily, callback: FunctionHandle, user_context: u32) {
        if let Some(previous) = self.registrations.register(family, callback, user_context) {
            if previous.callback != callback {
                debug!(?family, old = %previous.callback, new = %callback, "Callback replaced");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LinearMemory;

    fn mock() -> EvpMock {
        EvpMock::new(BridgeConfig::new().with_workspace_root("/repo")).unwrap()
    }

    #[test]
    fn test_initialize_returns_client_handle() {
        let evp = mock();
        assert_eq!(evp.initialize(), 999);
        assert_eq!(evp.api_calls()[0].call, EvpApiCall::Initialize);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(EvpMock::new(BridgeConfig::new().with_client_handle(0)).is_err());
    }

    #[test]
    fn test_workspace_directory_is_guest_owned() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        let addr = evp.get_workspace_directory(&mut mem, 999, 0);
        assert!(!addr.is_null());
        assert_eq!(mem.read_c_string(addr).unwrap(), "/repo/assets");
        assert!(mem.is_live(addr));
    }

    #[test]
    fn test_workspace_directory_allocation_failure() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        mem.fail_next_allocations(1);
        assert!(evp.get_workspace_directory(&mut mem, 999, 0).is_null());
    }

    #[test]
    fn test_poll_logs_before_waiting() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        assert_eq!(evp.process_event(&mut mem, 999, 0), evp_status::TIMEDOUT);
        assert_eq!(
            evp.api_calls()[0].call,
            EvpApiCall::ProcessEvent {
                handle: 999,
                timeout_ms: 0
            }
        );
        assert_eq!(evp.metrics().snapshot().timeouts, 1);
    }

    #[test]
    fn test_request_shutdown_is_not_logged_as_guest_call() {
        let evp = mock();
        evp.request_shutdown();
        assert_eq!(evp.api_call_count(), 0);
        assert_eq!(evp.pending_events(), 1);

        let mut mem = LinearMemory::new(4096);
        assert_eq!(evp.poll(&mut mem, 999, 0), PollStatus::ShouldExit);
        assert!(evp.api_calls().iter().all(|r| r.call.is_guest_call()));
    }

    #[test]
    fn test_send_state_acknowledged_on_poll() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        let cb = mem.register_function(|_, _| Ok(0));

        assert_eq!(evp.send_state(999, "led", b"on", cb, 8), evp_status::OK);
        assert_eq!(evp.pending_events(), 1);
        assert_eq!(evp.poll(&mut mem, 999, 0), PollStatus::Ok);
        assert_eq!(mem.invocations(), vec![(cb, vec![reason::SENT, 8])]);
    }

    #[test]
    fn test_blob_operation_completes() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        let cb = mem.register_function(|_, argv| Ok(argv[0] as i32));
        let request = BlobRequest {
            blob_type: 2,
            operation: 0,
            request: GuestAddr::NULL,
            url: Some("http://example.invalid/model".into()),
            local_store: GuestAddr::NULL,
        };
        evp.blob_operation(999, request, cb, 1);
        assert_eq!(evp.poll(&mut mem, 999, 0), PollStatus::Ok);
        assert_eq!(evp.metrics().snapshot().invoked, 1);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_send_message_keeps_receive_callback() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        let on_message = mem.register_function(|_, _| Ok(0));
        let on_sent = mem.register_function(|_, _| Ok(0));

        evp.set_message_callback(999, on_message, 0);
        evp.send_message(999, "out", b"x", on_sent, 0);
        assert_eq!(
            evp.registration(OperationFamily::Message).map(|r| r.callback),
            Some(on_message)
        );
    }

    #[test]
    fn test_dispatch_failure_logged_inbound() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        let cb = mem.register_function(|_, _| Ok(0));
        evp.set_configuration_callback(999, cb, 0);
        evp.push_configuration("t", vec![1]);
        mem.fail_next_allocations(1);

        assert_eq!(evp.poll(&mut mem, 999, 0), PollStatus::Ok);
        let last = evp.api_calls().pop().unwrap();
        assert!(matches!(
            last.call,
            EvpApiCall::DispatchDropped {
                outcome: crate::bridge::DispatchOutcome::AllocationFailed { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_cancelled_poll_should_exit() {
        let evp = mock();
        let mut mem = LinearMemory::new(4096);
        evp.cancel_handle().cancel();
        assert_eq!(evp.poll(&mut mem, 999, 1000), PollStatus::ShouldExit);
        assert_eq!(evp.metrics().snapshot().cancellations, 1);
    }
}
