//! Server presence store: per-topic keyed member metadata.
//!
//! Each topic maps a presence key to an ordered list of entries; multiple
//! entries under one key represent the same user on several devices or
//! sessions, disambiguated by a server-assigned `presence_ref`. Entries
//! applied from the fabric carry a sentinel owner so disconnect sweeps never
//! touch them.

use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::limits;

/// Owner prefix for entries mirrored from peer instances.
const REMOTE_OWNER_PREFIX: &str = "__remote__:";

#[derive(Clone, Debug)]
pub(crate) struct PresenceEntry {
    pub presence_ref: String,
    pub meta: Value,
    pub owner: String,
}

impl PresenceEntry {
    fn to_wire(&self) -> Value {
        json!({"presence_ref": self.presence_ref, "meta": self.meta})
    }
}

pub(crate) enum TrackOutcome {
    /// New entry for this (link, key); peers see a join.
    Joined { presence_ref: String },
    /// Meta replaced in place; same ref, peers see a no-op join update.
    Updated { presence_ref: String },
    /// Topic at entry capacity; tracking skipped.
    AtCapacity,
}

pub(crate) struct PresenceStore {
    /// topic -> key -> ordered entry list
    topics: DashMap<String, DashMap<String, Vec<PresenceEntry>>>,
    /// conn_id -> (topic, key) pairs it owns entries under
    owners: DashMap<String, DashSet<(String, String)>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Upsert a presence entry for (owner link, key). A fresh ref is
    /// allocated on first track; a re-track by the same link and key updates
    /// the meta in place and keeps the ref.
    pub fn track(&self, topic: &str, conn_id: &str, key: &str, meta: Value) -> TrackOutcome {
        let keys = self.topics.entry(topic.to_owned()).or_default();

        let existing_ref = keys
            .get(key)
            .and_then(|entries| entries.iter().find(|e| e.owner == conn_id).map(|e| e.presence_ref.clone()));

        if let Some(presence_ref) = existing_ref {
            if let Some(mut entries) = keys.get_mut(key) {
                if let Some(entry) = entries.iter_mut().find(|e| e.owner == conn_id) {
                    entry.meta = meta;
                    return TrackOutcome::Updated { presence_ref };
                }
            }
            // Entry vanished between lookup and update; fall through to insert.
        }

        let total: usize = keys.iter().map(|e| e.value().len()).sum();
        if total >= limits::MAX_PRESENCE_ENTRIES_PER_CHANNEL {
            return TrackOutcome::AtCapacity;
        }

        let presence_ref = Uuid::now_v7().to_string();
        keys.entry(key.to_owned()).or_default().push(PresenceEntry {
            presence_ref: presence_ref.clone(),
            meta,
            owner: conn_id.to_owned(),
        });
        self.owners
            .entry(conn_id.to_owned())
            .or_default()
            .insert((topic.to_owned(), key.to_owned()));
        TrackOutcome::Joined { presence_ref }
    }

    /// Remove the entry owned by (link, key). No-op when nothing is tracked.
    pub fn untrack(&self, topic: &str, conn_id: &str, key: &str) -> Option<PresenceEntry> {
        let removed = self.remove_entry(topic, key, |e| e.owner == conn_id);
        if removed.is_some() {
            if let Some(owned) = self.owners.get(conn_id) {
                owned.remove(&(topic.to_owned(), key.to_owned()));
            }
        }
        removed
    }

    /// Drop every entry a link owns, across all topics. Returns the leaves
    /// grouped per topic for diff emission.
    pub fn remove_connection(&self, conn_id: &str) -> Vec<(String, Vec<(String, PresenceEntry)>)> {
        let mut by_topic: Vec<(String, Vec<(String, PresenceEntry)>)> = Vec::new();
        if let Some((_, owned)) = self.owners.remove(conn_id) {
            for pair in owned.iter() {
                let (topic, key) = pair.clone();
                if let Some(entry) = self.remove_entry(&topic, &key, |e| e.owner == conn_id) {
                    match by_topic.iter_mut().find(|(t, _)| *t == topic) {
                        Some((_, leaves)) => leaves.push((key, entry)),
                        None => by_topic.push((topic, vec![(key, entry)])),
                    }
                }
            }
        }
        by_topic
    }

    /// Authoritative full snapshot for a topic, owner stripped.
    pub fn snapshot(&self, topic: &str) -> Value {
        let mut state = Map::new();
        if let Some(keys) = self.topics.get(topic) {
            for entry in keys.iter() {
                let list: Vec<Value> = entry.value().iter().map(PresenceEntry::to_wire).collect();
                state.insert(entry.key().clone(), Value::Array(list));
            }
        }
        Value::Object(state)
    }

    /// Drop every entry under a topic (forced channel close). Returns the
    /// number of entries removed.
    pub fn remove_topic(&self, topic: &str) -> usize {
        match self.topics.remove(topic) {
            Some((_, keys)) => {
                let mut removed = 0;
                for (key, entries) in keys.into_iter() {
                    for entry in entries {
                        if let Some(owned) = self.owners.get(&entry.owner) {
                            owned.remove(&(topic.to_owned(), key.clone()));
                        }
                        removed += 1;
                    }
                }
                removed
            }
            None => 0,
        }
    }

    pub fn entry_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |keys| keys.iter().map(|e| e.value().len()).sum())
    }

    // -----------------------------------------------------------------------
    // Fabric shadow: presence mirrored from peer instances
    // -----------------------------------------------------------------------

    /// Apply a track relayed by a peer instance. The carried ref is kept so
    /// every instance agrees on entry identity. Returns false when the event
    /// was a pure meta update of a known ref.
    pub fn apply_remote_track(
        &self,
        topic: &str,
        key: &str,
        presence_ref: &str,
        meta: Value,
        origin: &str,
    ) -> bool {
        let keys = self.topics.entry(topic.to_owned()).or_default();
        let mut entries = keys.entry(key.to_owned()).or_default();
        match entries.iter_mut().find(|e| e.presence_ref == presence_ref) {
            Some(entry) => {
                entry.meta = meta;
                false
            }
            None => {
                entries.push(PresenceEntry {
                    presence_ref: presence_ref.to_owned(),
                    meta,
                    owner: format!("{REMOTE_OWNER_PREFIX}{origin}"),
                });
                true
            }
        }
    }

    /// Apply an untrack relayed by a peer instance.
    pub fn apply_remote_untrack(
        &self,
        topic: &str,
        key: &str,
        presence_ref: &str,
    ) -> Option<PresenceEntry> {
        self.remove_entry(topic, key, |e| e.presence_ref == presence_ref)
    }

    fn remove_entry<F>(&self, topic: &str, key: &str, pred: F) -> Option<PresenceEntry>
    where
        F: Fn(&PresenceEntry) -> bool,
    {
        let mut removed = None;
        if let Some(keys) = self.topics.get(topic) {
            if let Some(mut entries) = keys.get_mut(key) {
                if let Some(pos) = entries.iter().position(&pred) {
                    removed = Some(entries.remove(pos));
                }
            }
            if removed.is_some() {
                keys.remove_if(key, |_, entries| entries.is_empty());
            }
        }
        if removed.is_some() {
            // remove_if prevents racing a concurrent track on the same topic.
            self.topics.remove_if(topic, |_, keys| keys.is_empty());
        }
        removed
    }
}

/// Build a `presence_diff` payload from join/leave entry lists.
pub(crate) fn diff_payload(
    joins: Vec<(String, Vec<PresenceEntry>)>,
    leaves: Vec<(String, Vec<PresenceEntry>)>,
) -> Value {
    let render = |groups: Vec<(String, Vec<PresenceEntry>)>| -> Value {
        let mut map = Map::new();
        for (key, entries) in groups {
            let list: Vec<Value> = entries.iter().map(PresenceEntry::to_wire).collect();
            map.insert(key, Value::Array(list));
        }
        Value::Object(map)
    };
    json!({"joins": render(joins), "leaves": render(leaves)})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_allocates_ref_once() {
        let store = PresenceStore::new();
        let first = store.track("room:1", "conn-a", "alice", json!({"status": "online"}));
        let TrackOutcome::Joined { presence_ref } = first else {
            panic!("expected join");
        };

        let second = store.track("room:1", "conn-a", "alice", json!({"status": "away"}));
        let TrackOutcome::Updated { presence_ref: same } = second else {
            panic!("expected in-place update");
        };
        assert_eq!(presence_ref, same);

        let snap = store.snapshot("room:1");
        assert_eq!(snap["alice"][0]["meta"]["status"], "away");
        assert_eq!(snap["alice"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_same_key_different_links() {
        let store = PresenceStore::new();
        store.track("room:1", "conn-a", "alice", json!({"d": 1}));
        store.track("room:1", "conn-b", "alice", json!({"d": 2}));
        let snap = store.snapshot("room:1");
        assert_eq!(snap["alice"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_untrack_idempotent() {
        let store = PresenceStore::new();
        store.track("room:1", "conn-a", "alice", json!({}));
        assert!(store.untrack("room:1", "conn-a", "alice").is_some());
        assert!(store.untrack("room:1", "conn-a", "alice").is_none());
        assert_eq!(store.entry_count("room:1"), 0);
    }

    #[test]
    fn test_untrack_before_track_is_noop() {
        let store = PresenceStore::new();
        assert!(store.untrack("room:1", "conn-a", "alice").is_none());
    }

    #[test]
    fn test_remove_connection_groups_by_topic() {
        let store = PresenceStore::new();
        store.track("room:1", "conn-a", "alice", json!({}));
        store.track("room:2", "conn-a", "alice", json!({}));
        store.track("room:1", "conn-b", "bob", json!({}));

        let mut leaves = store.remove_connection("conn-a");
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, "room:1");
        assert_eq!(leaves[0].1[0].0, "alice");
        assert_eq!(store.entry_count("room:1"), 1);
        assert_eq!(store.entry_count("room:2"), 0);
    }

    #[test]
    fn test_remote_track_untrack_roundtrip() {
        let store = PresenceStore::new();
        assert!(store.apply_remote_track("room:1", "carol", "ref-1", json!({"x": 1}), "peer"));
        // Meta update of a known ref is not a new join.
        assert!(!store.apply_remote_track("room:1", "carol", "ref-1", json!({"x": 2}), "peer"));
        assert_eq!(store.entry_count("room:1"), 1);

        assert!(store.apply_remote_untrack("room:1", "carol", "ref-1").is_some());
        assert_eq!(store.entry_count("room:1"), 0);
    }

    #[test]
    fn test_remote_entries_survive_local_disconnect() {
        let store = PresenceStore::new();
        store.track("room:1", "conn-a", "alice", json!({}));
        store.apply_remote_track("room:1", "carol", "ref-1", json!({}), "peer");

        store.remove_connection("conn-a");
        let snap = store.snapshot("room:1");
        assert!(snap.get("alice").is_none());
        assert!(snap.get("carol").is_some());
    }

    #[test]
    fn test_diff_payload_shape() {
        let payload = diff_payload(
            vec![(
                "bob".to_owned(),
                vec![PresenceEntry {
                    presence_ref: "r1".into(),
                    meta: json!({"status": "away"}),
                    owner: "conn-b".into(),
                }],
            )],
            vec![],
        );
        assert_eq!(payload["joins"]["bob"][0]["presence_ref"], "r1");
        assert!(payload["leaves"].as_object().unwrap().is_empty());
        assert!(payload["joins"]["bob"][0].get("owner").is_none());
    }
}
