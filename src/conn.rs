use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;

use mio::net::UdpSocket;
use mio::Token;

use crate::address::Transport;
use crate::data::Data;
use crate::event::Event;
use crate::Postbox;

/// Unique identifier for connections
///
/// Ids are stable for the life of the runtime: they are never reused, and
/// operations on an id whose connection is gone report an error instead of
/// touching someone else's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        ConnectionId(token.0 as u64)
    }
}

/// Whether the connection was created by `listen` or `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Initiator,
}

/// Callback invoked for every event on a connection.
///
/// Callbacks receive the runtime handle and may reenter it: calling
/// `listen`, `connect` or `send` from inside a callback is fine, and the
/// resulting events are delivered on the next run-loop tick. Payload bytes
/// must be copied out if they are needed past the callback's return.
pub type Callback = Rc<dyn Fn(&mut Postbox, &ConnectionInfo, Event, &Data)>;

/// Snapshot of connection state handed to callbacks.
///
/// On a listener the remote fields reflect the source of the most recent
/// datagram.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: Transport,
    pub role: Role,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    /// reply_id field of the frame that produced this event. Snapshotted at
    /// enqueue time, so it survives later frames read in the same tick;
    /// [`crate::Postbox::reply`] echoes it back with the reply bit set.
    pub(crate) reply_id: u16,
}

impl ConnectionInfo {
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from((self.remote_ip, self.remote_port))
    }

    /// The remote IP as dotted-quad text.
    pub fn ip_str(&self) -> String {
        self.remote_ip.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Open,
    Closed,
}

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) transport: Transport,
    pub(crate) role: Role,
    pub(crate) socket: Option<UdpSocket>,
    pub(crate) remote_ip: Ipv4Addr,
    pub(crate) remote_port: u16,
    /// reply_id field of the most recent inbound frame; each event's
    /// `ConnectionInfo` snapshots it.
    pub(crate) last_reply_id: u16,
    /// Whether the remote fields come from an actual datagram rather than
    /// the parsed bind address.
    pub(crate) peer_observed: bool,
    pub(crate) state: ConnState,
    pub(crate) callback: Callback,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Transport,
        role: Role,
        callback: Callback,
    ) -> Connection {
        Connection {
            id,
            transport,
            role,
            socket: None,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            last_reply_id: 0,
            peer_observed: false,
            state: ConnState::Open,
            callback,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from((self.remote_ip, self.remote_port))
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            transport: self.transport,
            role: self.role,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            reply_id: self.last_reply_id,
        }
    }
}
