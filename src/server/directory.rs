//! Peer directory: who is registered on which channel, in which role.
//!
//! Maps `(channel_id, role)` to the connections registered under it,
//! keyed by client id. An entry exists only while it has at least one
//! member.
//!
//! # Example
//!
//! ```ignore
//! let directory = PeerDirectory::new();
//! directory.register(channel, Role::Provider, provider_id, connection);
//!
//! // A consumer on the same channel asks for someone to talk to.
//! let (peer_id, peer) = directory.get_peer(channel, Role::Consumer).unwrap();
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::Connection;
use crate::protocol::Role;

type Members = HashMap<Uuid, Connection>;

/// Registry of live peers, shared by all router tasks of one server.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: RwLock<HashMap<(Uuid, Role), Members>>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns `false` (and changes nothing) if the client id
    /// is already registered under this channel and role.
    pub fn register(&self, channel_id: Uuid, role: Role, client_id: Uuid, connection: Connection) -> bool {
        let mut entries = self.entries.write();
        let members = entries.entry((channel_id, role)).or_default();
        if members.contains_key(&client_id) {
            return false;
        }
        members.insert(client_id, connection);
        true
    }

    /// Remove a peer, dropping the entry once it is empty.
    pub fn unregister(&self, channel_id: Uuid, role: Role, client_id: Uuid) -> Option<Connection> {
        let mut entries = self.entries.write();
        let key = (channel_id, role);
        let members = entries.get_mut(&key)?;
        let removed = members.remove(&client_id);
        if members.is_empty() {
            entries.remove(&key);
        }
        removed
    }

    /// One live peer of the role opposite to `requester`, first found.
    pub fn get_peer(&self, channel_id: Uuid, requester: Role) -> Option<(Uuid, Connection)> {
        let entries = self.entries.read();
        entries
            .get(&(channel_id, requester.opposite()))?
            .iter()
            .find(|(_, connection)| !connection.is_closed())
            .map(|(id, connection)| (*id, connection.clone()))
    }

    /// A specific live peer.
    pub fn get(&self, channel_id: Uuid, role: Role, client_id: Uuid) -> Option<Connection> {
        let entries = self.entries.read();
        entries
            .get(&(channel_id, role))?
            .get(&client_id)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Every live peer on the channel, both roles, except `exclude`.
    pub fn channel_peers(&self, channel_id: Uuid, exclude: Uuid) -> Vec<(Uuid, Connection)> {
        let entries = self.entries.read();
        [Role::Consumer, Role::Provider]
            .iter()
            .filter_map(|role| entries.get(&(channel_id, *role)))
            .flat_map(|members| members.iter())
            .filter(|(id, connection)| **id != exclude && !connection.is_closed())
            .map(|(id, connection)| (*id, connection.clone()))
            .collect()
    }

    /// Total number of registered peers.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    /// Check if no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every peer, returning their connections.
    pub fn drain(&self) -> Vec<Connection> {
        self.entries
            .write()
            .drain()
            .flat_map(|(_, members)| members.into_values())
            .collect()
    }
}
