//! Event dispatch into the guest.
//!
//! One event in, at most one guest callback out. Variable-length fields are
//! marshalled into a single [`MarshalBuffer`] that is released when the buffer
//! goes out of scope, after the callback has returned or failed.

use super::event::{EvpEvent, OperationFamily};
use crate::bridge::{DispatchOutcome, RegistrationTable};
use crate::error::MemoryError;
use crate::memory::{
    marshalled_len, nul_terminated, FunctionHandle, GuestAddr, GuestMemory, GuestStruct,
    MarshalBuffer,
};
use tracing::{debug, warn};

/// Turns dequeued [`EvpEvent`]s into guest callback invocations
pub struct Dispatcher<'a> {
    registrations: &'a RegistrationTable<OperationFamily>,
}

impl<'a> Dispatcher<'a> {
    /// Create a dispatcher over a registration table
    pub fn new(registrations: &'a RegistrationTable<OperationFamily>) -> Self {
        Self { registrations }
    }

    /// Deliver one event
    pub fn dispatch(&self, arena: &mut dyn GuestMemory, event: &EvpEvent) -> DispatchOutcome {
        let family = match event.family() {
            Some(family) => family,
            None => return DispatchOutcome::NoListener,
        };

        let outcome = match event {
            EvpEvent::StateDelivered {
                reason,
                callback,
                user_context,
            }
            | EvpEvent::TelemetryDelivered {
                reason,
                callback,
                user_context,
            }
            | EvpEvent::MessageSent {
                reason,
                callback,
                user_context,
            }
            | EvpEvent::RpcResponseSent {
                reason,
                callback,
                user_context,
            } => match self.acknowledged(family, *callback) {
                Some(callback) => invoked(
                    callback,
                    arena.invoke_indirect(callback, &[*reason, *user_context]),
                ),
                None => DispatchOutcome::NoListener,
            },

            EvpEvent::ConfigurationPushed { topic, payload }
            | EvpEvent::MessageReceived { topic, payload } => match self.registered(family) {
                Some((callback, user_context)) => {
                    let topic = nul_terminated(topic);
                    let payload_len = payload.len() as u32;
                    invoked(
                        callback,
                        marshal_and_invoke(
                            arena,
                            callback,
                            &[topic.as_slice(), payload.as_slice()],
                            |fields| vec![fields[0].0, fields[1].0, payload_len, user_context],
                        ),
                    )
                }
                None => DispatchOutcome::NoListener,
            },

            EvpEvent::RpcRequestPushed { id, method, params } => match self.registered(family) {
                Some((callback, user_context)) => {
                    let method = nul_terminated(method);
                    let params = nul_terminated(params);
                    // EVP_RPC_ID is a u64; wasm32 passes it as two slots, low word first
                    let (id_lo, id_hi) = (*id as u32, (*id >> 32) as u32);
                    invoked(
                        callback,
                        marshal_and_invoke(
                            arena,
                            callback,
                            &[method.as_slice(), params.as_slice()],
                            |fields| vec![id_lo, id_hi, fields[0].0, fields[1].0, user_context],
                        ),
                    )
                }
                None => DispatchOutcome::NoListener,
            },

            EvpEvent::BlobOperationDone {
                reason,
                result,
                callback,
                user_context,
            } => match self.acknowledged(family, *callback) {
                Some(callback) => {
                    let block = result.to_bytes();
                    let (reason, user_context) = (*reason, *user_context);
                    invoked(
                        callback,
                        marshal_and_invoke(arena, callback, &[block.as_slice()], |fields| {
                            vec![reason, fields[0].0, user_context]
                        }),
                    )
                }
                None => DispatchOutcome::NoListener,
            },

            EvpEvent::ShutdownRequested => DispatchOutcome::NoListener,
        };

        match &outcome {
            DispatchOutcome::Invoked { callback, status } => {
                debug!(event = event.name(), callback = %callback, status, "Dispatched event");
            }
            DispatchOutcome::NoListener => {
                debug!(event = event.name(), "No listener registered, dropping event");
            }
            DispatchOutcome::AllocationFailed { len } => {
                warn!(event = event.name(), len, "Guest allocation failed, dropping event");
            }
            DispatchOutcome::InvocationFailed { callback, error } => {
                warn!(event = event.name(), callback = %callback, error = %error, "Guest callback failed");
            }
        }
        outcome
    }

    /// Current registration for a pushed event
    fn registered(&self, family: OperationFamily) -> Option<(FunctionHandle, u32)> {
        self.registrations
            .lookup(family)
            .filter(|entry| !entry.callback.is_null())
            .map(|entry| (entry.callback, entry.user_context))
    }

    /// The acknowledgment's own callback, if it is still the family's registration
    fn acknowledged(
        &self,
        family: OperationFamily,
        callback: FunctionHandle,
    ) -> Option<FunctionHandle> {
        if callback.is_null() {
            return None;
        }
        match self.registrations.lookup(family) {
            Some(entry) if entry.callback == callback => Some(callback),
            _ => None,
        }
    }
}

fn invoked(callback: FunctionHandle, result: Result<i32, MemoryError>) -> DispatchOutcome {
    match result {
        Ok(status) => DispatchOutcome::Invoked { callback, status },
        Err(error) => DispatchOutcome::from_memory_error(callback, error),
    }
}

/// Write `fields` back to back into one guest allocation, then call `callback`
/// with the argument vector built from the field addresses.
fn marshal_and_invoke<F>(
    arena: &mut dyn GuestMemory,
    callback: FunctionHandle,
    fields: &[&[u8]],
    argv: F,
) -> Result<i32, MemoryError>
where
    F: FnOnce(&[GuestAddr]) -> Vec<u32>,
{
    let len = marshalled_len(fields).ok_or(MemoryError::AllocationFailed { len: u32::MAX })?;
    let mut buffer = MarshalBuffer::acquire(arena, len)?;

    let mut offset = 0u32;
    let mut addrs = Vec::with_capacity(fields.len());
    for field in fields {
        addrs.push(buffer.write_at(offset, field)?);
        offset += field.len() as u32;
    }

    let argv = argv(&addrs);
    buffer.invoke(callback, &argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evp::event::reason;
    use crate::memory::{BlobResultEvp, LinearMemory, MemoryEvent};
    use std::sync::{Arc, Mutex};

    fn recorder(mem: &mut LinearMemory) -> (FunctionHandle, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = mem.register_function(move |mem, argv| {
            // capture the topic and payload while the buffer is still live
            let topic = mem.read_c_string(GuestAddr(argv[0]))?;
            let payload = mem.read(GuestAddr(argv[1]), argv[2])?;
            sink.lock().unwrap().push(topic.into_bytes());
            sink.lock().unwrap().push(payload);
            Ok(0)
        });
        (handle, seen)
    }

    #[test]
    fn test_configuration_marshalling() {
        let mut mem = LinearMemory::new(64 * 1024);
        let (handle, seen) = recorder(&mut mem);
        let table = RegistrationTable::new();
        table.register(OperationFamily::Configuration, handle, 77);

        let event = EvpEvent::ConfigurationPushed {
            topic: "t".into(),
            payload: vec![1, 2, 3],
        };
        let outcome = Dispatcher::new(&table).dispatch(&mut mem, &event);
        assert_eq!(outcome, DispatchOutcome::Invoked { callback: handle, status: 0 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], b"t".to_vec());
        assert_eq!(seen[1], vec![1, 2, 3]);

        let (_, argv) = &mem.invocations()[0];
        assert_eq!(argv[1], argv[0] + 2);
        assert_eq!(argv[2], 3);
        assert_eq!(argv[3], 77);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_buffer_freed_after_invoke() {
        let mut mem = LinearMemory::new(64 * 1024);
        let handle = mem.register_function(|_, _| Ok(0));
        let table = RegistrationTable::new();
        table.register(OperationFamily::Message, handle, 0);

        let event = EvpEvent::MessageReceived {
            topic: "topic".into(),
            payload: b"hello".to_vec(),
        };
        Dispatcher::new(&table).dispatch(&mut mem, &event);

        let history = mem.history();
        let alloc = history
            .iter()
            .position(|e| matches!(e, MemoryEvent::Alloc { .. }))
            .unwrap();
        let invoke = history
            .iter()
            .position(|e| matches!(e, MemoryEvent::Invoke { .. }))
            .unwrap();
        let free = history
            .iter()
            .position(|e| matches!(e, MemoryEvent::Free { .. }))
            .unwrap();
        assert!(alloc < invoke && invoke < free);
    }

    #[test]
    fn test_rpc_id_split() {
        let mut mem = LinearMemory::new(64 * 1024);
        let handle = mem.register_function(|mem, argv| {
            assert_eq!(mem.read_c_string(GuestAddr(argv[2]))?, "ping");
            assert_eq!(mem.read_c_string(GuestAddr(argv[3]))?, "{}");
            Ok(0)
        });
        let table = RegistrationTable::new();
        table.register(OperationFamily::Rpc, handle, 5);

        let event = EvpEvent::RpcRequestPushed {
            id: 0x0000_0002_0000_0001,
            method: "ping".into(),
            params: "{}".into(),
        };
        assert!(Dispatcher::new(&table).dispatch(&mut mem, &event).is_invoked());
        let (_, argv) = &mem.invocations()[0];
        assert_eq!((argv[0], argv[1], argv[4]), (1, 2, 5));
    }

    #[test]
    fn test_ack_uses_event_context() {
        let mut mem = LinearMemory::new(4096);
        let handle = mem.register_function(|_, _| Ok(0));
        let table = RegistrationTable::new();
        table.register(OperationFamily::State, handle, 1);

        let event = EvpEvent::StateDelivered {
            reason: reason::SENT,
            callback: handle,
            user_context: 42,
        };
        assert!(Dispatcher::new(&table).dispatch(&mut mem, &event).is_invoked());
        assert_eq!(mem.invocations(), vec![(handle, vec![reason::SENT, 42])]);
        // acknowledgments need no guest allocation
        assert!(!mem
            .history()
            .iter()
            .any(|e| matches!(e, MemoryEvent::Alloc { .. })));
    }

    #[test]
    fn test_stale_ack_dropped() {
        let mut mem = LinearMemory::new(4096);
        let first = mem.register_function(|_, _| Ok(0));
        let second = mem.register_function(|_, _| Ok(0));
        let table = RegistrationTable::new();
        table.register(OperationFamily::Telemetry, first, 0);
        table.register(OperationFamily::Telemetry, second, 0);

        let stale = EvpEvent::TelemetryDelivered {
            reason: reason::SENT,
            callback: first,
            user_context: 0,
        };
        assert_eq!(
            Dispatcher::new(&table).dispatch(&mut mem, &stale),
            DispatchOutcome::NoListener
        );
        assert!(mem.invocations().is_empty());
    }

    #[test]
    fn test_null_ack_callback_dropped() {
        let mut mem = LinearMemory::new(4096);
        let table = RegistrationTable::new();
        table.register(OperationFamily::State, FunctionHandle::NULL, 0);
        let event = EvpEvent::StateDelivered {
            reason: reason::SENT,
            callback: FunctionHandle::NULL,
            user_context: 0,
        };
        assert_eq!(
            Dispatcher::new(&table).dispatch(&mut mem, &event),
            DispatchOutcome::NoListener
        );
    }

    #[test]
    fn test_blob_result_marshalled() {
        let mut mem = LinearMemory::new(4096);
        let handle = mem.register_function(|mem, argv| {
            let result = BlobResultEvp::decode(&mem.read(GuestAddr(argv[1]), BlobResultEvp::SIZE)?);
            Ok(result.http_status as i32)
        });
        let table = RegistrationTable::new();
        table.register(OperationFamily::Blob, handle, 3);

        let event = EvpEvent::BlobOperationDone {
            reason: reason::BLOB_DONE,
            result: BlobResultEvp::success(),
            callback: handle,
            user_context: 3,
        };
        assert_eq!(
            Dispatcher::new(&table).dispatch(&mut mem, &event),
            DispatchOutcome::Invoked {
                callback: handle,
                status: 200
            }
        );
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_drops_event() {
        let mut mem = LinearMemory::new(4096);
        let handle = mem.register_function(|_, _| Ok(0));
        let table = RegistrationTable::new();
        table.register(OperationFamily::Configuration, handle, 0);
        mem.fail_next_allocations(1);

        let event = EvpEvent::ConfigurationPushed {
            topic: "t".into(),
            payload: vec![9],
        };
        assert_eq!(
            Dispatcher::new(&table).dispatch(&mut mem, &event),
            DispatchOutcome::AllocationFailed { len: 3 }
        );
        assert!(mem.invocations().is_empty());
    }

    #[test]
    fn test_invalid_handle_frees_buffer() {
        let mut mem = LinearMemory::new(4096);
        let table = RegistrationTable::new();
        table.register(OperationFamily::Configuration, FunctionHandle(99), 0);

        let event = EvpEvent::ConfigurationPushed {
            topic: "t".into(),
            payload: vec![],
        };
        let outcome = Dispatcher::new(&table).dispatch(&mut mem, &event);
        assert!(matches!(outcome, DispatchOutcome::InvocationFailed { .. }));
        assert_eq!(mem.live_allocations(), 0);
    }
}
