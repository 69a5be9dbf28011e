use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use tokio::sync::mpsc;
use super::connection::ConnectionId;
use tracing::{debug, warn};

/// Outbound half of a connection: serialized frames queued for the
/// connection's writer task. Sending never blocks.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Outcome of removing a connection from its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The connection was not registered under that key.
    NotFound,
    /// Removed; other connections remain in the group.
    Removed,
    /// Removed the last connection; the key is gone.
    GroupEmptied,
}

/// Connections grouped by key (a user identity, a chat pair, ...).
///
/// The pool is not locked on its own. Owners wrap it in a single mutex so
/// that check-then-mutate-then-send sequences stay atomic.
#[derive(Debug)]
pub struct ConnectionPool<K> {
    groups: BTreeMap<K, HashMap<ConnectionId, Outbound>>,
}

impl<K> Default for ConnectionPool<K> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone + Display> ConnectionPool<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sender` under `key`. Returns `true` when this created the
    /// group, i.e. it is the key's first connection.
    pub fn add(&mut self, key: K, id: ConnectionId, sender: Outbound) -> bool {
        let created = !self.groups.contains_key(&key);
        let group = self.groups.entry(key.clone()).or_default();
        group.insert(id, sender);
        debug!("Added connection {} to group {} ({} in group)", id, key, group.len());
        created
    }

    pub fn remove(&mut self, key: &K, id: &ConnectionId) -> Removal {
        let Some(group) = self.groups.get_mut(key) else {
            return Removal::NotFound;
        };
        if group.remove(id).is_none() {
            return Removal::NotFound;
        }
        debug!("Removed connection {} from group {}", id, key);

        if group.is_empty() {
            self.groups.remove(key);
            Removal::GroupEmptied
        } else {
            Removal::Removed
        }
    }

    /// Best-effort delivery to every connection in one group. Returns the
    /// number of connections the frame was queued for.
    pub fn send_to_group(&self, key: &K, text: &str) -> usize {
        self.groups
            .get(key)
            .map(|group| deliver(group.iter(), text))
            .unwrap_or(0)
    }

    /// Best-effort delivery to every connection, skipping the group under
    /// `exclude` if given.
    pub fn broadcast(&self, text: &str, exclude: Option<&K>) -> usize {
        self.groups
            .iter()
            .filter(|(key, _)| Some(*key) != exclude)
            .map(|(_, group)| deliver(group.iter(), text))
            .sum()
    }

    pub fn keys(&self) -> Vec<K> {
        self.groups.keys().cloned().collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.groups.contains_key(key)
    }

    pub fn group_size(&self, key: &K) -> usize {
        self.groups.get(key).map(HashMap::len).unwrap_or(0)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn connection_count(&self) -> usize {
        self.groups.values().map(HashMap::len).sum()
    }
}

fn deliver<'a>(targets: impl Iterator<Item = (&'a ConnectionId, &'a Outbound)>, text: &str) -> usize {
    let mut delivered = 0;
    for (id, sender) in targets {
        match sender.send(text.to_string()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Failed to deliver to connection {}: {}", id, e),
        }
    }
    delivered
}
