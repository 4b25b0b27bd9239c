use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::address::Transport;
use crate::conn::{Connection, ConnectionId};

/// Identity of a remote endpoint, keyed byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerKey {
    pub(crate) ip: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) transport: Transport,
}

/// What we know about a remote endpoint.
pub(crate) struct PeerStatus {
    pub(crate) last_seen: Instant,
    /// Connection that first observed the endpoint; its teardown releases
    /// the entry.
    pub(crate) via: ConnectionId,
}

/// Owns every connection and the peer-status map.
///
/// Connection ids double as poll tokens; id 0 is reserved, and ids are never
/// reused, so a stale id can only miss; it can never alias a newer
/// connection.
pub(crate) struct Registry {
    pub(crate) conns: HashMap<ConnectionId, Connection>,
    pub(crate) peers: HashMap<PeerKey, PeerStatus>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            conns: HashMap::new(),
            peers: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.id, conn);
    }

    /// Removes the connection and every peer entry it introduced.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        self.purge_peers_via(id);
        Some(conn)
    }

    pub(crate) fn purge_peers_via(&mut self, id: ConnectionId) {
        self.peers.retain(|_, status| status.via != id);
    }

    /// Records a packet from `key`. Returns true when the endpoint had never
    /// been seen before; subsequent sightings only refresh the timestamp.
    pub(crate) fn peer_seen(&mut self, key: PeerKey, via: ConnectionId) -> bool {
        match self.peers.get_mut(&key) {
            Some(status) => {
                status.last_seen = Instant::now();
                false
            }
            None => {
                self.peers.insert(
                    key,
                    PeerStatus {
                        last_seen: Instant::now(),
                        via,
                    },
                );
                true
            }
        }
    }

    /// Refreshes an existing peer's timestamp. An absent endpoint stays
    /// unseen, so its first data frame still announces it.
    pub(crate) fn peer_refresh(&mut self, key: &PeerKey) {
        if let Some(status) = self.peers.get_mut(key) {
            status.last_seen = Instant::now();
        }
    }

    pub(crate) fn peer_last_seen(&self, key: &PeerKey) -> Option<Instant> {
        self.peers.get(key).map(|status| status.last_seen)
    }

    pub(crate) fn open_connection_count(&self) -> usize {
        self.conns.values().filter(|c| c.is_open()).count()
    }
}
