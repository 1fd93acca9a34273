// The process-wide table of live connections.
//
// Two maps are kept: connection id -> handler (plus the username bound to it, if any), and
// username -> connection id. Both are concurrent maps so that connection threads can insert,
// remove and look up without serializing on one global lock. A username is bound to at most one
// live connection at a time.
//
// Lock discipline: the only place that touches both maps at once is `login`, which holds a
// `logins` entry while reading `active`. Nothing holds an `active` guard while reaching into
// `logins`, and no guard is ever held across a socket write.

use crate::tftp::Packet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ConnectionId = u64;

/// The sending half of a connection, as seen by the registry.
pub trait ConnectionHandler: Send + Sync {
    /// Writes one fully-framed packet to the peer.
    fn send(&self, packet: &Packet) -> io::Result<()>;
}

struct ActiveConnection {
    handler: Arc<dyn ConnectionHandler>,
    username: Option<String>,
}

pub struct Connections {
    next_id: AtomicU64,
    active: DashMap<ConnectionId, ActiveConnection>,
    logins: DashMap<String, ConnectionId>,
}

impl Default for Connections {
    fn default() -> Self {
        Connections::new()
    }
}

impl Connections {
    pub fn new() -> Connections {
        Connections {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            logins: DashMap::new(),
        }
    }

    /// Hands out ids that are unique for the lifetime of the process.
    pub fn new_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a handler under `id`. Returns false if the id is already in use.
    pub fn connect(&self, id: ConnectionId, handler: Arc<dyn ConnectionHandler>) -> bool {
        match self.active.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ActiveConnection { handler, username: None });
                true
            }
        }
    }

    /// Forgets the connection and releases its username. Safe to call more than once.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.active.remove(&id) {
            if let Some(username) = conn.username {
                self.logins.remove_if(&username, |_, holder| *holder == id);
                log::info!("Connection {id} ({username}) left");
            }
        }
    }

    /// Binds `username` to `id`. Returns false iff the name is held by a different live
    /// connection (or `id` itself isn't connected).
    pub fn login(&self, id: ConnectionId, username: &str) -> bool {
        if !self.active.contains_key(&id) {
            return false;
        }

        match self.logins.entry(username.to_string()) {
            Entry::Occupied(mut holder) => {
                let current = *holder.get();
                if current == id {
                    return true;
                }
                if self.active.contains_key(&current) {
                    return false;
                }
                log::debug!("Reclaiming '{username}' from departed connection {current}");
                holder.insert(id);
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        match self.active.get_mut(&id) {
            Some(mut conn) => {
                conn.username = Some(username.to_string());
                true
            }
            None => {
                // Disconnected while we were binding the name.
                self.logins.remove_if(username, |_, holder| *holder == id);
                false
            }
        }
    }

    pub fn is_logged_in(&self, id: ConnectionId) -> bool {
        self.active
            .get(&id)
            .map(|conn| conn.username.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn username(&self, id: ConnectionId) -> Option<String> {
        self.active.get(&id).and_then(|conn| conn.username.clone())
    }

    /// Sends to one connection. Unknown ids and failed writes are dropped and reported as false.
    pub fn send(&self, id: ConnectionId, packet: &Packet) -> bool {
        let handler = match self.active.get(&id) {
            Some(conn) => Arc::clone(&conn.handler),
            None => return false,
        };

        match handler.send(packet) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Unable to send {:?} to connection {id}: {e}", packet.opcode());
                false
            }
        }
    }

    /// Sends to every connection that is logged in right now.
    pub fn send_all(&self, packet: &Packet) {
        let recipients: Vec<ConnectionId> = self.logins.iter().map(|entry| *entry.value()).collect();
        for id in recipients {
            self.send(id, packet);
        }
    }
}
