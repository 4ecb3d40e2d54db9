//! The server's authoritative client registry: a primary `id -> record`
//! index and a secondary `name -> ids` index that must always agree on
//! membership.

use std::net::SocketAddr;

use indexmap::{IndexMap, IndexSet};

/// One accepted connection, as tracked by the server.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: i16,
    pub name: String,
    pub endpoint: SocketAddr,
    /// Heartbeat liveness flag. Cleared when a `Ping` is sent, set again
    /// when the client replies with `Pong`.
    pub alive: bool,
}

/// Owns both indexes. All mutation happens on server-internal paths only;
/// the two indexes are always kept in agreement.
#[derive(Default)]
pub struct Roster {
    by_id: IndexMap<i16, ClientRecord>,
    by_name: std::collections::HashMap<String, IndexSet<i16>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i16) -> Option<&ClientRecord> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: i16) -> Option<&mut ClientRecord> {
        self.by_id.get_mut(&id)
    }

    pub fn contains(&self, id: i16) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Inserts a new record, adding it to the name index in registration
    /// order. If `id` is already present, the previous record is replaced
    /// (and removed from its old name-index entry first).
    pub fn insert(&mut self, record: ClientRecord) {
        self.remove(record.id);
        self.by_name.entry(record.name.clone()).or_default().insert(record.id);
        self.by_id.insert(record.id, record);
    }

    /// Removes `id` from both indexes. No-op if absent.
    pub fn remove(&mut self, id: i16) -> Option<ClientRecord> {
        let record = self.by_id.shift_remove(&id)?;
        if let Some(ids) = self.by_name.get_mut(&record.name) {
            ids.shift_remove(&id);
            if ids.is_empty() {
                self.by_name.remove(&record.name);
            }
        }
        Some(record)
    }

    /// Ids registered under `name`, in registration order.
    pub fn ids_for_name(&self, name: &str) -> Vec<i16> {
        self.by_name.get(name).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    /// All ids currently in the roster, in insertion order.
    pub fn ids(&self) -> Vec<i16> {
        self.by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.by_id.values_mut()
    }
}
