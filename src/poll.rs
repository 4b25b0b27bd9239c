use std::io;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll};

use crate::conn::ConnectionId;

/// Thin wrapper over the OS readiness poller.
///
/// Sockets are registered read-only under their connection id; `wait` blocks
/// for at most the given timeout and reports which connections have inbound
/// data. Readiness is edge-style, so callers must drain a ready socket until
/// it would block.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new(events_capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
        })
    }

    pub(crate) fn register(&self, socket: &mut UdpSocket, id: ConnectionId) -> io::Result<()> {
        self.poll
            .registry()
            .register(socket, id.token(), Interest::READABLE)
    }

    pub(crate) fn deregister(&self, socket: &mut UdpSocket) -> io::Result<()> {
        self.poll.registry().deregister(socket)
    }

    pub(crate) fn wait(&mut self, timeout: Duration) -> io::Result<Vec<ConnectionId>> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(self
            .events
            .iter()
            .filter(|event| event.is_readable())
            .map(|event| ConnectionId::from_token(event.token()))
            .collect())
    }
}
