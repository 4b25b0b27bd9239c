//! The run-loop dispatcher.
//!
//! One tick waits for socket readiness, reads every pending frame, turns
//! frames into queued events, then drains the queue through the user
//! callbacks. Callbacks run only here; the rest of the crate never calls
//! back into user code.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::conn::{ConnState, ConnectionId};
use crate::data::Data;
use crate::error::PostboxError;
use crate::event::Event;
use crate::header::{Header, MessageType, HEADER_LEN, REPLY_FLAG};
use crate::logger::LogLevel;
use crate::registry::PeerKey;
use crate::Postbox;

/// Receive errors that mean the peer is gone rather than a transient hiccup.
fn is_fatal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

impl Postbox {
    /// Runs one dispatcher tick, waiting up to `timeout_ms` for readiness.
    ///
    /// Events enqueued before or during the tick are delivered in FIFO
    /// order; events enqueued *by* a callback are held for the next tick.
    /// Returns the number of callbacks invoked.
    pub fn runloop(&mut self, timeout_ms: u64) -> usize {
        match self.poller.wait(Duration::from_millis(timeout_ms)) {
            Ok(ready) => {
                for id in ready {
                    self.read_ready(id);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                // No connection is known to be at fault here, so this never
                // becomes a user event.
                self.config
                    .logger
                    .log(LogLevel::Error, &format!("internal poll error: {}", e));
            }
        }
        self.drain()
    }

    fn drain(&mut self) -> usize {
        let batch = self.queue.take();
        let count = batch.len();
        for call in batch {
            (call.callback.as_ref())(self, &call.info, call.event, &call.data);
            // call.data and any retired socket drop here, after the callback.
        }
        count
    }

    /// Drains every pending datagram on one ready socket.
    fn read_ready(&mut self, id: ConnectionId) {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            let peeked = match self.registry.conns.get(&id) {
                Some(conn) if conn.is_open() => match conn.socket.as_ref() {
                    Some(socket) => socket.peek_from(&mut header_buf),
                    None => return,
                },
                _ => return,
            };
            match peeked {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let fatal = is_fatal(e.kind());
                    self.enqueue_error_for(id, &PostboxError::Recv(e).to_string());
                    if fatal {
                        self.retire_connection(id, Event::ConnectionLost);
                    }
                    break;
                }
                Ok((len, _)) if len < HEADER_LEN => {
                    debug_assert!(false, "datagram shorter than the frame header");
                    self.discard_datagram(id);
                    continue;
                }
                Ok(_) => {}
            }

            let header = match Header::decode(&header_buf) {
                Some(header) => header,
                None => {
                    debug_assert!(false, "unknown message type on the wire");
                    self.discard_datagram(id);
                    continue;
                }
            };
            if let Some(conn) = self.registry.conns.get_mut(&id) {
                conn.last_reply_id = header.reply_id;
            }
            if header.num_packets != 1 {
                // Reassembly is reserved in the header but not implemented.
                debug_assert!(false, "multi-packet messages are not supported");
                self.discard_datagram(id);
                continue;
            }

            match header.message_type {
                MessageType::Heartbeat => {
                    if let Some(src) = self.discard_datagram(id) {
                        self.touch_peer(id, src);
                    }
                }
                MessageType::Close => {
                    self.discard_datagram(id);
                    self.retire_connection(id, Event::ConnectionClosed);
                    break;
                }
                message_type => {
                    if !self.read_datagram(id, message_type, header.reply_id) {
                        break;
                    }
                }
            }
        }
    }

    /// Receives one full data frame and enqueues its event. Returns false
    /// when the socket has nothing more to give this tick.
    fn read_datagram(
        &mut self,
        id: ConnectionId,
        message_type: MessageType,
        raw_reply_id: u16,
    ) -> bool {
        let mut buf = vec![0u8; self.config.recv_buffer_len];
        let received = match self.registry.conns.get(&id) {
            Some(conn) => match conn.socket.as_ref() {
                Some(socket) => socket.recv_from(&mut buf),
                None => return false,
            },
            None => return false,
        };
        let (len, src) = match received {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                let fatal = is_fatal(e.kind());
                self.enqueue_error_for(id, &PostboxError::Recv(e).to_string());
                if fatal {
                    self.retire_connection(id, Event::ConnectionLost);
                }
                return false;
            }
        };
        let src_ip = match src.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return true,
        };
        buf.truncate(len);

        // The datagram's source becomes the connection's current remote.
        let (callback, info, transport) = match self.registry.conns.get_mut(&id) {
            Some(conn) => {
                conn.remote_ip = src_ip;
                conn.remote_port = src.port();
                conn.peer_observed = true;
                (conn.callback.clone(), conn.info(), conn.transport)
            }
            None => return false,
        };

        let key = PeerKey {
            ip: src_ip,
            port: src.port(),
            transport,
        };
        if self.registry.peer_seen(key, id) {
            // First sighting of this endpoint; announce it ahead of the data.
            self.enqueue(
                callback.clone(),
                info.clone(),
                Event::ConnectionReady,
                Data::empty(),
                None,
            );
        }

        let data = Data::from_frame(buf);
        let event = match message_type {
            MessageType::OneWay => Event::Message,
            MessageType::Request => Event::Request,
            MessageType::Reply => Event::Reply,
            MessageType::Heartbeat | MessageType::Close => return true,
        };
        if message_type == MessageType::Reply {
            let correlation = raw_reply_id & !REPLY_FLAG;
            if let Some(reply_callback) = self.pending_replies.remove(&(id, correlation)) {
                self.enqueue(reply_callback, info, Event::Reply, data, None);
                return true;
            }
        }
        self.enqueue(callback, info, event, data, None);
        true
    }

    /// Consumes and drops the datagram at the head of the socket's queue.
    fn discard_datagram(&self, id: ConnectionId) -> Option<SocketAddr> {
        let mut scratch = [0u8; HEADER_LEN];
        let conn = self.registry.conns.get(&id)?;
        let socket = conn.socket.as_ref()?;
        socket.recv_from(&mut scratch).ok().map(|(_, src)| src)
    }

    /// Heartbeats refresh an already-seen peer's timestamp. They never
    /// register the endpoint: first-seen belongs to the data path, so the
    /// peer's first data frame still gets its connection-ready event.
    fn touch_peer(&mut self, id: ConnectionId, src: SocketAddr) {
        let transport = match self.registry.conns.get(&id) {
            Some(conn) => conn.transport,
            None => return,
        };
        if let IpAddr::V4(ip) = src.ip() {
            self.registry.peer_refresh(&PeerKey {
                ip,
                port: src.port(),
                transport,
            });
        }
    }

    /// Marks the connection closed, releases its peer entries and poll
    /// registration, and queues `event`. The socket rides on the pending
    /// event so the descriptor closes only after the callback has run.
    pub(crate) fn retire_connection(&mut self, id: ConnectionId, event: Event) {
        let parts = match self.registry.conns.get_mut(&id) {
            Some(conn) => {
                conn.state = ConnState::Closed;
                Some((conn.callback.clone(), conn.info(), conn.socket.take()))
            }
            None => None,
        };
        let (callback, info, socket) = match parts {
            Some(parts) => parts,
            None => return,
        };
        self.registry.purge_peers_via(id);
        self.pending_replies.retain(|&(cid, _), _| cid != id);
        let socket = socket.map(|mut socket| {
            let _ = self.poller.deregister(&mut socket);
            socket
        });
        self.enqueue(callback, info, event, Data::empty(), socket);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::conn::ConnectionInfo;

    type EventLog = Rc<RefCell<Vec<(Event, String)>>>;

    fn recorder(log: &EventLog) -> impl Fn(&mut Postbox, &ConnectionInfo, Event, &Data) + 'static {
        let log = log.clone();
        move |_pb, _info, event, data| {
            log.borrow_mut().push((event, data.as_str().into_owned()));
        }
    }

    fn pump_until(pb: &mut Postbox, log: &EventLog, want: usize) {
        for _ in 0..100 {
            if log.borrow().len() >= want {
                return;
            }
            pb.runloop(10);
        }
    }

    fn listen_loopback(pb: &mut Postbox, log: &EventLog) -> (ConnectionId, u16) {
        let id = pb.listen("udp://127.0.0.1:0", recorder(log));
        let port = pb.local_addr(id).unwrap().port();
        (id, port)
    }

    #[test]
    fn test_tick_with_no_sockets_invokes_no_callbacks() {
        let mut pb = Postbox::new().unwrap();
        assert_eq!(pb.runloop(0), 0);
    }

    #[test]
    fn test_loopback_one_way_ordering() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (_, port) = listen_loopback(&mut server, &log);

        let mut client = Postbox::new().unwrap();
        let cid = client.connect(&format!("udp://127.0.0.1:{}", port), |_, _, _, _| {});
        client.runloop(0);

        let mut data = Data::new("hi");
        client.send(cid, &mut data);

        pump_until(&mut server, &log, 3);
        assert_eq!(
            *log.borrow(),
            vec![
                (Event::Listening, String::new()),
                (Event::ConnectionReady, String::new()),
                (Event::Message, "hi".to_string()),
            ]
        );
    }

    #[test]
    fn test_first_seen_is_reported_once() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (_, port) = listen_loopback(&mut server, &log);

        let mut client = Postbox::new().unwrap();
        let cid = client.connect(&format!("udp://127.0.0.1:{}", port), |_, _, _, _| {});
        client.runloop(0);
        client.send(cid, &mut Data::new("one"));
        client.send(cid, &mut Data::new("two"));

        pump_until(&mut server, &log, 4);
        let events: Vec<Event> = log.borrow().iter().map(|(event, _)| *event).collect();
        assert_eq!(
            events,
            vec![
                Event::Listening,
                Event::ConnectionReady,
                Event::Message,
                Event::Message,
            ]
        );
    }

    #[test]
    fn test_bad_address_reports_error_only() {
        let mut pb = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        pb.listen("http://x:1", recorder(&log));
        pb.runloop(0);

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Event::Error);
        assert!(log[0].1.contains("scheme"));
    }

    #[test]
    fn test_stream_scheme_is_rejected() {
        let mut pb = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        pb.listen("tcp://127.0.0.1:0", recorder(&log));
        pb.runloop(0);

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Event::Error);
        assert!(log[0].1.contains("stream transport"));
    }

    #[test]
    fn test_callback_enqueues_deliver_on_the_next_tick() {
        let mut pb = Postbox::new().unwrap();
        let log: Rc<RefCell<Vec<(usize, Event)>>> = Rc::new(RefCell::new(Vec::new()));
        let tick = Rc::new(RefCell::new(0usize));

        let outer_log = log.clone();
        let outer_tick = tick.clone();
        pb.listen("udp://127.0.0.1:0", move |pb, _info, event, _data| {
            outer_log.borrow_mut().push((*outer_tick.borrow(), event));
            if event == Event::Listening {
                let inner_log = outer_log.clone();
                let inner_tick = outer_tick.clone();
                pb.connect("udp://127.0.0.1:9", move |_, _, event, _| {
                    inner_log.borrow_mut().push((*inner_tick.borrow(), event));
                });
            }
        });

        pb.runloop(0);
        assert_eq!(*log.borrow(), vec![(0, Event::Listening)]);

        *tick.borrow_mut() = 1;
        pb.runloop(0);
        assert_eq!(
            *log.borrow(),
            vec![(0, Event::Listening), (1, Event::ConnectionReady)]
        );
    }

    #[test]
    fn test_close_frame_retires_the_connection() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (sid, port) = listen_loopback(&mut server, &log);

        let mut client = Postbox::new().unwrap();
        let cid = client.connect(&format!("udp://127.0.0.1:{}", port), |_, _, _, _| {});
        client.runloop(0);
        client.send(cid, &mut Data::new("hi"));
        pump_until(&mut server, &log, 3);

        client.disconnect(cid);
        pump_until(&mut server, &log, 4);
        assert_eq!(log.borrow().last().unwrap().0, Event::ConnectionClosed);
        assert_eq!(server.connection_count(), 0);

        // The id is retired, not recycled; sends on it now report an error.
        server.send(sid, &mut Data::new("late"));
        pump_until(&mut server, &log, 5);
        let log = log.borrow();
        assert_eq!(log.last().unwrap().0, Event::Error);
        assert!(log.last().unwrap().1.contains("closed"));
    }

    #[test]
    fn test_get_routes_reply_to_dedicated_callback() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let server_log = log.clone();
        let sid = server.listen("udp://127.0.0.1:0", move |pb, info, event, data| {
            server_log
                .borrow_mut()
                .push((event, data.as_str().into_owned()));
            if event == Event::Request {
                let mut answer = Data::new("pong");
                pb.reply(info, &mut answer);
            }
        });
        let port = server.local_addr(sid).unwrap().port();

        let mut client = Postbox::new().unwrap();
        let client_log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let cid = client.connect(&format!("udp://127.0.0.1:{}", port), recorder(&client_log));
        client.runloop(0);

        let replies: EventLog = Rc::new(RefCell::new(Vec::new()));
        client.get(cid, &mut Data::new("ping"), recorder(&replies));

        pump_until(&mut server, &log, 3);
        pump_until(&mut client, &replies, 1);

        assert_eq!(*replies.borrow(), vec![(Event::Reply, "pong".to_string())]);
        // The connection's own callback saw the ready event, not the reply.
        assert!(client_log
            .borrow()
            .iter()
            .all(|(event, _)| *event != Event::Reply));
        assert_eq!(
            log.borrow().last().unwrap(),
            &(Event::Request, "ping".to_string())
        );
    }

    #[test]
    fn test_reply_correlates_with_the_request_not_later_frames() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let server_log = log.clone();
        let sid = server.listen("udp://127.0.0.1:0", move |pb, info, event, data| {
            server_log
                .borrow_mut()
                .push((event, data.as_str().into_owned()));
            if event == Event::Request {
                pb.reply(info, &mut Data::new("pong"));
            }
        });
        let port = server.local_addr(sid).unwrap().port();

        let mut client = Postbox::new().unwrap();
        let cid = client.connect(&format!("udp://127.0.0.1:{}", port), |_, _, _, _| {});
        client.runloop(0);

        // A one-way right behind the request: both frames are read in the
        // same server tick, so the one-way's sentinel id is the last thing
        // the connection saw when the request callback runs.
        let replies: EventLog = Rc::new(RefCell::new(Vec::new()));
        client.get(cid, &mut Data::new("ping"), recorder(&replies));
        client.send(cid, &mut Data::new("noise"));

        pump_until(&mut server, &log, 4);
        pump_until(&mut client, &replies, 1);
        assert_eq!(*replies.borrow(), vec![(Event::Reply, "pong".to_string())]);
    }

    #[test]
    fn test_heartbeat_produces_no_user_event() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (_, port) = listen_loopback(&mut server, &log);
        pump_until(&mut server, &log, 1);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let heartbeat = Header {
            message_type: MessageType::Heartbeat,
            num_packets: 1,
            packet_id: 0,
            reply_id: 1,
        };
        sender
            .send_to(&heartbeat.encode(), ("127.0.0.1", port))
            .unwrap();

        for _ in 0..10 {
            server.runloop(10);
        }
        assert_eq!(*log.borrow(), vec![(Event::Listening, String::new())]);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_heartbeat_does_not_claim_first_seen() {
        let mut server = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (_, port) = listen_loopback(&mut server, &log);
        pump_until(&mut server, &log, 1);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let heartbeat = Header {
            message_type: MessageType::Heartbeat,
            num_packets: 1,
            packet_id: 0,
            reply_id: 1,
        };
        sender
            .send_to(&heartbeat.encode(), ("127.0.0.1", port))
            .unwrap();
        for _ in 0..10 {
            server.runloop(10);
        }

        // The first data frame from the same endpoint is still announced.
        let mut frame = Header::one_way().encode().to_vec();
        frame.extend_from_slice(b"hi");
        sender.send_to(&frame, ("127.0.0.1", port)).unwrap();

        pump_until(&mut server, &log, 3);
        assert_eq!(
            *log.borrow(),
            vec![
                (Event::Listening, String::new()),
                (Event::ConnectionReady, String::new()),
                (Event::Message, "hi".to_string()),
            ]
        );
    }

    #[test]
    fn test_unlisten_removes_the_listener() {
        let mut pb = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let (id, _) = listen_loopback(&mut pb, &log);
        pump_until(&mut pb, &log, 1);

        pb.unlisten(id);
        assert_eq!(pb.connection_count(), 0);
        assert!(pb.local_addr(id).is_none());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut pb = Postbox::new().unwrap();
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        listen_loopback(&mut pb, &log);
        pb.connect("udp://127.0.0.1:9", recorder(&log));
        pb.shutdown();

        assert_eq!(pb.connection_count(), 0);
        // Undelivered events were dropped along with the sockets.
        assert_eq!(pb.runloop(0), 0);
    }
}
