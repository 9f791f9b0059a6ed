//! The event queue pair.
//!
//! Outbound: host simulation → guest callback, consumed one event at a time by a
//! blocking poll. Inbound: an append-only log of guest → host calls for test
//! assertions. The outbound side is the only point where driver and guest
//! threads meet.

use super::record::ApiCallRecord;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

/// Result of a blocking dequeue
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued<E> {
    /// The oldest pending event
    Event(E),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The wait was interrupted through a [`CancelHandle`]
    Cancelled,
}

impl<E> Dequeued<E> {
    /// The event, if one was dequeued
    pub fn into_event(self) -> Option<E> {
        match self {
            Dequeued::Event(event) => Some(event),
            _ => None,
        }
    }
}

struct Outbound<E> {
    events: Mutex<VecDeque<E>>,
    available: Condvar,
    cancelled: AtomicBool,
}

trait Interrupt: Send + Sync {
    fn set_cancelled(&self, cancelled: bool);
}

impl<E: Send> Interrupt for Outbound<E> {
    fn set_cancelled(&self, cancelled: bool) {
        // flip under the queue lock so a waiter cannot miss the wakeup
        let _events = self.events.lock();
        self.cancelled.store(cancelled, Ordering::SeqCst);
        self.available.notify_all();
    }
}

/// Interrupts threads blocked in [`EventQueuePair::dequeue_outbound`]
///
/// Cancellation is sticky: once cancelled, every dequeue returns
/// [`Dequeued::Cancelled`] until [`CancelHandle::reset`] is called.
#[derive(Clone)]
pub struct CancelHandle {
    target: Arc<dyn Interrupt>,
}

impl CancelHandle {
    /// Wake every waiter with a cancellation result
    pub fn cancel(&self) {
        self.target.set_cancelled(true);
    }

    /// Re-arm the queue after a cancellation
    pub fn reset(&self) {
        self.target.set_cancelled(false);
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

/// Outbound event queue plus inbound API-call log for one mock session
///
/// Inbound sequence numbers are assigned under the log lock, so a record's
/// `seq` is also its position in the log.
pub struct EventQueuePair<E, C> {
    session: Uuid,
    outbound: Arc<Outbound<E>>,
    inbound: Mutex<Vec<ApiCallRecord<C>>>,
    logged: Condvar,
}

impl<E: Send + 'static, C> EventQueuePair<E, C> {
    /// Create an empty queue pair for `session`
    pub fn new(session: Uuid) -> Self {
        Self {
            session,
            outbound: Arc::new(Outbound {
                events: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
            inbound: Mutex::new(Vec::new()),
            logged: Condvar::new(),
        }
    }

    /// Session this queue pair belongs to
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Append an event to the outbound tail. Never blocks on consumers.
    pub fn enqueue_outbound(&self, event: E) {
        let mut events = self.outbound.events.lock();
        events.push_back(event);
        trace!(session = %self.session, pending = events.len(), "Enqueued outbound event");
        drop(events);
        self.outbound.available.notify_one();
    }

    /// Wait up to `timeout` for the oldest outbound event
    ///
    /// A zero timeout checks the queue once without waiting.
    pub fn dequeue_outbound(&self, timeout: Duration) -> Dequeued<E> {
        let deadline = Instant::now().checked_add(timeout);
        let mut events = self.outbound.events.lock();
        loop {
            if self.outbound.cancelled.load(Ordering::SeqCst) {
                return Dequeued::Cancelled;
            }
            if let Some(event) = events.pop_front() {
                return Dequeued::Event(event);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Dequeued::TimedOut;
                    }
                    self.outbound.available.wait_until(&mut events, deadline);
                }
                // timeout too large to represent: wait without a deadline
                None => self.outbound.available.wait(&mut events),
            }
        }
    }

    /// Remove the oldest pending event matching `pred`
    ///
    /// Lets a caller take back an event it enqueued but never consumed.
    pub fn retract_outbound<F>(&self, mut pred: F) -> Option<E>
    where
        F: FnMut(&E) -> bool,
    {
        let mut events = self.outbound.events.lock();
        let index = events.iter().position(|event| pred(event))?;
        events.remove(index)
    }

    /// Number of outbound events not yet dequeued
    pub fn pending(&self) -> usize {
        self.outbound.events.lock().len()
    }

    /// Handle that interrupts blocked dequeues
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            target: self.outbound.clone(),
        }
    }

    /// Whether the queue is currently cancelled
    pub fn is_cancelled(&self) -> bool {
        self.outbound.cancelled.load(Ordering::SeqCst)
    }

    /// Append an immutable snapshot of a guest call and wake inbound waiters
    pub fn log_inbound(&self, call: C) -> u64 {
        let mut log = self.inbound.lock();
        let seq = log.len() as u64;
        log.push(ApiCallRecord::new(seq, self.session, call));
        drop(log);
        self.logged.notify_all();
        seq
    }

    /// Number of logged guest calls
    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }
}

impl<E: Send + 'static, C: Clone> EventQueuePair<E, C> {
    /// Copy of the inbound log, oldest first
    pub fn inbound_snapshot(&self) -> Vec<ApiCallRecord<C>> {
        self.inbound.lock().clone()
    }

    /// Wait up to `timeout` for the record with sequence number `seq`
    ///
    /// Does not consume anything: several observers can follow the same log.
    pub fn wait_inbound(&self, seq: u64, timeout: Duration) -> Option<ApiCallRecord<C>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut log = self.inbound.lock();
        loop {
            if let Some(record) = usize::try_from(seq).ok().and_then(|i| log.get(i)) {
                return Some(record.clone());
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    self.logged.wait_until(&mut log, deadline);
                }
                None => self.logged.wait(&mut log),
            }
        }
    }
}
