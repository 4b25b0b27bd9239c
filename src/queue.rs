use std::mem;

use mio::net::UdpSocket;

use crate::conn::{Callback, ConnectionInfo};
use crate::data::Data;
use crate::event::Event;

/// One queued callback invocation.
///
/// The record carries everything delivery needs, resolved at enqueue time:
/// the callback, a snapshot of the connection, and the payload. A connection
/// torn down while its event is still queued is therefore still deliverable.
/// `retired_socket` holds the socket of a connection being torn down; it is
/// dropped, closing the descriptor, only after the callback returns.
pub(crate) struct PendingEvent {
    pub(crate) callback: Callback,
    pub(crate) info: ConnectionInfo,
    pub(crate) event: Event,
    pub(crate) data: Data,
    pub(crate) retired_socket: Option<UdpSocket>,
}

/// FIFO of pending callback invocations, drained once per tick.
pub(crate) struct EventQueue {
    pending: Vec<PendingEvent>,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue {
            pending: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, event: PendingEvent) {
        self.pending.push(event);
    }

    /// Swaps the queue for a fresh one and returns everything queued so far.
    ///
    /// Enqueues made while the returned batch is being drained (callbacks
    /// reentering the runtime) land in the fresh queue and are delivered on
    /// the next tick.
    pub(crate) fn take(&mut self) -> Vec<PendingEvent> {
        mem::take(&mut self.pending)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
