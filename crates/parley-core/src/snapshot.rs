//! Directory snapshot: the `update:` payload every online peer receives.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// What a peer knows about one nickname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub endpoint: SocketAddr,
    pub presence: Presence,
}

/// Full directory as broadcast by the server.
///
/// `version` grows by one with every directory mutation. Broadcasts are sent
/// without holding the directory lock, so two can cross on the wire; peers
/// keep whichever has the higher version. `epoch` is picked at random when a
/// server starts, so versions are only compared within one server run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub epoch: u64,
    pub version: u64,
    pub entries: BTreeMap<String, EntryView>,
}

impl DirectorySnapshot {
    pub fn get(&self, nickname: &str) -> Option<&EntryView> {
        self.entries.get(nickname)
    }

    /// Nicknames currently online, in name order.
    pub fn online(&self) -> impl Iterator<Item = (&str, &EntryView)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.presence == Presence::Online)
            .map(|(n, e)| (n.as_str(), e))
    }

    /// Change a known entry's presence. Returns false if the nickname is unknown.
    pub fn set_presence(&mut self, nickname: &str, presence: Presence) -> bool {
        match self.entries.get_mut(nickname) {
            Some(entry) => {
                entry.presence = presence;
                true
            }
            None => false,
        }
    }

    /// True if `other` should replace this snapshot: it is newer, or it
    /// comes from a restarted server.
    pub fn is_superseded_by(&self, other: &DirectorySnapshot) -> bool {
        other.epoch != self.epoch || other.version > self.version
    }
}
