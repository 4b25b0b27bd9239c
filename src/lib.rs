//! Event-driven message-box runtime over UDP sockets.
//!
//! Applications exchange discrete, typed messages without writing socket
//! code: register listeners and outbound connections by URL-style address,
//! supply a callback for each, and drive the run loop. The runtime polls
//! every registered socket for readiness, frames datagrams behind an 8-byte
//! header, and delivers [`Event`]s to the callbacks, always from inside
//! [`Postbox::runloop`] and never from the registration calls themselves.
//!
//! ```no_run
//! use postbox::{Data, Event, Postbox};
//!
//! fn main() -> postbox::Result<()> {
//!     let mut pb = Postbox::new()?;
//!     pb.listen("udp://*:4040", |pb, conn, event, data| {
//!         if event == Event::Message {
//!             let mut echo = Data::new(&data.as_str());
//!             pb.send(conn.id, &mut echo);
//!         }
//!     });
//!     loop {
//!         pb.runloop(150);
//!     }
//! }
//! ```
//!
//! Callbacks receive the runtime handle and may call back into it; anything
//! they enqueue is delivered on the next tick. Errors follow the same path:
//! a bad address or a failed bind surfaces as an [`Event::Error`] on the
//! next tick, not as a return value.

pub mod address;
pub mod config;
pub mod conn;
pub mod data;
pub mod error;
pub mod event;
pub mod logger;

mod header;
mod poll;
mod queue;
mod reactor;
mod registry;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

use mio::net::UdpSocket;

pub use address::{Address, Transport};
pub use config::{PostboxConfig, PostboxConfigBuilder, MAX_PAYLOAD_LEN, RECV_BUFFER_LEN};
pub use conn::{Callback, ConnectionId, ConnectionInfo, Role};
pub use data::Data;
pub use error::{PostboxError, Result};
pub use event::Event;
pub use logger::{LogLevel, Logger, NoOpLogger, StderrLogger};

use conn::Connection;
use header::{Header, ReplyIds, REPLY_FLAG};
use poll::Poller;
use queue::{EventQueue, PendingEvent};
use registry::{PeerKey, Registry};

/// The message-box runtime.
///
/// Owns the poller, the connection registry, the peer-status map and the
/// deferred callback queue. Everything runs on the caller's thread; the only
/// blocking point is the readiness wait inside [`Postbox::runloop`].
pub struct Postbox {
    pub(crate) poller: Poller,
    pub(crate) registry: Registry,
    pub(crate) queue: EventQueue,
    pub(crate) reply_ids: ReplyIds,
    pub(crate) pending_replies: HashMap<(ConnectionId, u16), Callback>,
    pub(crate) config: PostboxConfig,
}

impl Postbox {
    pub fn new() -> Result<Postbox> {
        Self::with_config(PostboxConfig::default())
    }

    pub fn with_config(config: PostboxConfig) -> Result<Postbox> {
        Ok(Postbox {
            poller: Poller::new(config.events_capacity)?,
            registry: Registry::new(),
            queue: EventQueue::new(),
            reply_ids: ReplyIds::new(),
            pending_replies: HashMap::new(),
            config,
        })
    }

    /// Binds a datagram socket on `address` (e.g. `udp://*:4040`) and
    /// registers `callback` for its events.
    ///
    /// On success the callback sees [`Event::Listening`] on the next tick;
    /// on failure it sees [`Event::Error`] and the id stays unregistered.
    pub fn listen<F>(&mut self, address: &str, callback: F) -> ConnectionId
    where
        F: Fn(&mut Postbox, &ConnectionInfo, Event, &Data) + 'static,
    {
        self.open_socket(address, Rc::new(callback), Role::Listener)
    }

    /// Opens an outbound datagram socket to `address`.
    ///
    /// The callback sees [`Event::ConnectionReady`] on the next tick (once
    /// per distinct remote endpoint), or [`Event::Error`] on failure.
    pub fn connect<F>(&mut self, address: &str, callback: F) -> ConnectionId
    where
        F: Fn(&mut Postbox, &ConnectionInfo, Event, &Data) + 'static,
    {
        self.open_socket(address, Rc::new(callback), Role::Initiator)
    }

    fn open_socket(&mut self, address: &str, callback: Callback, role: Role) -> ConnectionId {
        let id = self.registry.alloc_id();

        let parsed = match Address::parse(address) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.enqueue_setup_error(id, callback, Transport::Udp, role, &e.to_string());
                return id;
            }
        };
        if parsed.transport == Transport::Tcp {
            let msg = PostboxError::UnsupportedTransport(address.to_string()).to_string();
            self.enqueue_setup_error(id, callback, Transport::Tcp, role, &msg);
            return id;
        }

        let opened = match role {
            Role::Listener => UdpSocket::bind(parsed.socket_addr()).map_err(PostboxError::Bind),
            Role::Initiator => UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
                .and_then(|socket| socket.connect(parsed.socket_addr()).map(|()| socket))
                .map_err(PostboxError::Connect),
        };
        let mut socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                self.enqueue_setup_error(id, callback, parsed.transport, role, &e.to_string());
                return id;
            }
        };
        if let Err(e) = self.poller.register(&mut socket, id) {
            let msg = PostboxError::Io(e).to_string();
            self.enqueue_setup_error(id, callback, parsed.transport, role, &msg);
            return id;
        }

        let mut conn = Connection::new(id, parsed.transport, role, callback);
        conn.socket = Some(socket);
        conn.remote_ip = parsed.ip;
        conn.remote_port = parsed.port;
        let info = conn.info();
        let callback = conn.callback.clone();
        self.registry.insert(conn);

        match role {
            Role::Listener => {
                self.enqueue(callback, info, Event::Listening, Data::empty(), None);
            }
            Role::Initiator => {
                let key = PeerKey {
                    ip: parsed.ip,
                    port: parsed.port,
                    transport: parsed.transport,
                };
                if self.registry.peer_seen(key, id) {
                    self.enqueue(callback, info, Event::ConnectionReady, Data::empty(), None);
                }
            }
        }
        id
    }

    /// Sends `data` as a one-way message.
    ///
    /// The header is written into the buffer's reserved prefix in place; the
    /// buffer stays with the caller and can be reused. On a listener the
    /// frame goes to the connection's current remote, the source of the
    /// most recent inbound datagram.
    pub fn send(&mut self, conn: ConnectionId, data: &mut Data) {
        self.transmit(conn, data, Header::one_way());
    }

    /// Answers the request that produced `request`'s event, echoing the
    /// correlation id carried on the snapshot with the reply bit set.
    ///
    /// Taking the snapshot rather than the connection keeps the correlation
    /// correct even when later frames arrived in the same tick.
    pub fn reply(&mut self, request: &ConnectionInfo, data: &mut Data) {
        let correlation = request.reply_id & !REPLY_FLAG;
        self.transmit(request.id, data, Header::reply_to(correlation));
    }

    /// Sends `data` as a request and routes the matching reply to
    /// `on_reply` instead of the connection's callback.
    pub fn get<F>(&mut self, conn: ConnectionId, data: &mut Data, on_reply: F)
    where
        F: Fn(&mut Postbox, &ConnectionInfo, Event, &Data) + 'static,
    {
        let reply_id = self.reply_ids.next();
        if self.transmit(conn, data, Header::request(reply_id)) {
            self.pending_replies.insert((conn, reply_id), Rc::new(on_reply));
        }
    }

    /// Sends a close frame to the peer, then removes the connection.
    ///
    /// Also reaps a connection the peer already closed; in that case no
    /// frame is sent.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let send_close = match self.registry.conns.get(&conn) {
            None => {
                self.log_unknown(conn);
                return;
            }
            Some(c) if c.is_open() => c.role == Role::Initiator || c.peer_observed,
            Some(_) => false,
        };
        if send_close {
            let mut data = Data::with_len(0);
            self.transmit(conn, &mut data, Header::close());
        }
        self.remove_connection(conn);
    }

    /// Removes a listener connection. No frame is sent.
    pub fn unlisten(&mut self, conn: ConnectionId) {
        if self.registry.conns.contains_key(&conn) {
            self.remove_connection(conn);
        } else {
            self.log_unknown(conn);
        }
    }

    /// Releases every connection, peer entry and undelivered event.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.registry.conns.keys().copied().collect();
        for id in ids {
            self.remove_connection(id);
        }
        self.queue.clear();
        self.pending_replies.clear();
    }

    /// The locally bound address of the connection's socket. Handy after
    /// binding to port 0.
    pub fn local_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.registry
            .conns
            .get(&conn)?
            .socket
            .as_ref()?
            .local_addr()
            .ok()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.registry.open_connection_count()
    }

    /// Number of events queued for delivery on the next tick.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// When the connection's current remote endpoint was last heard from
    /// (data or heartbeat).
    pub fn peer_last_seen(&self, conn: ConnectionId) -> Option<Instant> {
        let c = self.registry.conns.get(&conn)?;
        let key = PeerKey {
            ip: c.remote_ip,
            port: c.remote_port,
            transport: c.transport,
        };
        self.registry.peer_last_seen(&key)
    }

    /// Writes `header` into `data`'s prefix and puts the frame on the wire.
    /// Returns true when the frame was handed to the OS.
    fn transmit(&mut self, id: ConnectionId, data: &mut Data, header: Header) -> bool {
        let (role, remote, open) = match self.registry.conns.get(&id) {
            Some(conn) => (conn.role, conn.remote_addr(), conn.is_open()),
            None => {
                self.log_unknown(id);
                return false;
            }
        };
        if !open {
            let msg = PostboxError::ClosedConnection(id).to_string();
            self.enqueue_error_for(id, &msg);
            return false;
        }

        data.set_header(header);
        let result = match self.registry.conns.get(&id).and_then(|c| c.socket.as_ref()) {
            Some(socket) => {
                if role == Role::Listener {
                    socket.send_to(data.frame(), remote)
                } else {
                    socket.send(data.frame())
                }
            }
            None => return false,
        };
        match result {
            Ok(_) => true,
            // Best-effort: a full send buffer drops the frame like the wire would.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.enqueue_error_for(id, &PostboxError::Send(e).to_string());
                false
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.registry.remove(id) {
            if let Some(mut socket) = conn.socket.take() {
                let _ = self.poller.deregister(&mut socket);
            }
        }
        self.pending_replies.retain(|&(cid, _), _| cid != id);
    }

    pub(crate) fn enqueue(
        &mut self,
        callback: Callback,
        info: ConnectionInfo,
        event: Event,
        data: Data,
        retired_socket: Option<UdpSocket>,
    ) {
        self.queue.push(PendingEvent {
            callback,
            info,
            event,
            data,
            retired_socket,
        });
    }

    pub(crate) fn enqueue_error_for(&mut self, id: ConnectionId, message: &str) {
        let target = self
            .registry
            .conns
            .get(&id)
            .map(|conn| (conn.callback.clone(), conn.info()));
        match target {
            Some((callback, info)) => {
                self.enqueue(callback, info, Event::Error, Data::new(message), None);
            }
            None => self.config.logger.log(LogLevel::Warn, message),
        }
    }

    /// Error path for connections that never made it into the registry.
    fn enqueue_setup_error(
        &mut self,
        id: ConnectionId,
        callback: Callback,
        transport: Transport,
        role: Role,
        message: &str,
    ) {
        let info = ConnectionInfo {
            id,
            transport,
            role,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            reply_id: 0,
        };
        self.enqueue(callback, info, Event::Error, Data::new(message), None);
    }

    fn log_unknown(&self, id: ConnectionId) {
        self.config
            .logger
            .log(LogLevel::Warn, &PostboxError::UnknownConnection(id).to_string());
    }
}
