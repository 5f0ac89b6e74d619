//! Client presence reconciler: merges authoritative snapshots with
//! incremental diffs into a local state map.
//!
//! State shape: presence key -> ordered list of `{presence_ref, meta}`.
//! Multiple entries under one key are the same user on several sessions.
//!
//! A diff observed before any snapshot is applied against empty state. This
//! is deliberate: diffs are self-sufficient for peers that subscribe after
//! the snapshot moment, and the server sends a joiner its snapshot before
//! any peer-originated diff can reach it.

use std::collections::BTreeMap;

use serde_json::Value;

/// One presence under a key.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMeta {
    pub presence_ref: String,
    pub meta: Value,
}

/// key -> ordered presences.
pub type PresenceState = BTreeMap<String, Vec<PresenceMeta>>;

type SyncHook = Box<dyn Fn(&PresenceState) + Send + Sync>;
type KeyHook = Box<dyn Fn(&str, &[PresenceMeta]) + Send + Sync>;

pub(crate) struct PresenceReconciler {
    state: PresenceState,
    on_sync: Vec<SyncHook>,
    on_join: Vec<KeyHook>,
    on_leave: Vec<KeyHook>,
}

impl PresenceReconciler {
    pub fn new() -> Self {
        Self {
            state: PresenceState::new(),
            on_sync: Vec::new(),
            on_join: Vec::new(),
            on_leave: Vec::new(),
        }
    }

    pub fn on_sync(&mut self, hook: SyncHook) {
        self.on_sync.push(hook);
    }

    pub fn on_join(&mut self, hook: KeyHook) {
        self.on_join.push(hook);
    }

    pub fn on_leave(&mut self, hook: KeyHook) {
        self.on_leave.push(hook);
    }

    pub fn state(&self) -> PresenceState {
        self.state.clone()
    }

    /// `presence_state`: replace local state wholesale, then sync.
    pub fn handle_state(&mut self, payload: &Value) {
        self.state = parse_state(payload);
        self.emit_sync();
    }

    /// `presence_diff`: leaves before joins, then one sync.
    pub fn handle_diff(&mut self, payload: &Value) {
        let leaves = parse_state(payload.get("leaves").unwrap_or(&Value::Null));
        let joins = parse_state(payload.get("joins").unwrap_or(&Value::Null));

        let mut left: Vec<(String, Vec<PresenceMeta>)> = Vec::new();
        for (key, departing) in leaves {
            let Some(current) = self.state.get_mut(&key) else {
                continue;
            };
            let mut removed = Vec::new();
            for presence in &departing {
                if let Some(pos) = current
                    .iter()
                    .position(|p| p.presence_ref == presence.presence_ref)
                {
                    removed.push(current.remove(pos));
                }
            }
            if current.is_empty() {
                self.state.remove(&key);
            }
            if !removed.is_empty() {
                left.push((key, removed));
            }
        }

        let mut joined: Vec<(String, Vec<PresenceMeta>)> = Vec::new();
        for (key, arriving) in joins {
            let current = self.state.entry(key.clone()).or_default();
            let mut added = Vec::new();
            for presence in arriving {
                // Union by ref: a re-track update is a no-op here.
                if !current
                    .iter()
                    .any(|p| p.presence_ref == presence.presence_ref)
                {
                    current.push(presence.clone());
                    added.push(presence);
                }
            }
            if !added.is_empty() {
                joined.push((key, added));
            }
        }

        for (key, removed) in &left {
            for hook in &self.on_leave {
                hook(key, removed);
            }
        }
        for (key, added) in &joined {
            for hook in &self.on_join {
                hook(key, added);
            }
        }
        self.emit_sync();
    }

    fn emit_sync(&self) {
        for hook in &self.on_sync {
            hook(&self.state);
        }
    }
}

/// Parse the wire shape `{key: [{presence_ref, meta?}, ...], ...}`.
/// Leave entries may omit `meta`.
fn parse_state(payload: &Value) -> PresenceState {
    let mut state = PresenceState::new();
    let Some(map) = payload.as_object() else {
        return state;
    };
    for (key, list) in map {
        let Some(list) = list.as_array() else {
            continue;
        };
        let presences: Vec<PresenceMeta> = list
            .iter()
            .filter_map(|entry| {
                let presence_ref = entry.get("presence_ref")?.as_str()?.to_owned();
                let meta = entry.get("meta").cloned().unwrap_or(Value::Null);
                Some(PresenceMeta { presence_ref, meta })
            })
            .collect();
        if !presences.is_empty() {
            state.insert(key.clone(), presences);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_snapshot_replaces_state_and_syncs() {
        let mut rec = PresenceReconciler::new();
        let syncs = Arc::new(AtomicUsize::new(0));
        let s = syncs.clone();
        rec.on_sync(Box::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        rec.handle_state(&json!({
            "alice": [{"presence_ref": "r1", "meta": {"status": "online"}}]
        }));
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        let state = rec.state();
        assert_eq!(state["alice"][0].presence_ref, "r1");

        rec.handle_state(&json!({"bob": [{"presence_ref": "r2", "meta": {}}]}));
        let state = rec.state();
        assert!(!state.contains_key("alice"));
        assert!(state.contains_key("bob"));
    }

    #[test]
    fn test_diff_leaves_before_joins() {
        let mut rec = PresenceReconciler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        rec.on_leave(Box::new(move |key, _| {
            o1.lock().unwrap().push(format!("leave:{key}"));
        }));
        let o2 = order.clone();
        rec.on_join(Box::new(move |key, _| {
            o2.lock().unwrap().push(format!("join:{key}"));
        }));

        rec.handle_state(&json!({
            "alice": [{"presence_ref": "r1", "meta": {}}]
        }));
        rec.handle_diff(&json!({
            "joins": {"bob": [{"presence_ref": "r2", "meta": {"status": "away"}}]},
            "leaves": {"alice": [{"presence_ref": "r1"}]}
        }));

        assert_eq!(*order.lock().unwrap(), vec!["leave:alice", "join:bob"]);
        let state = rec.state();
        assert!(!state.contains_key("alice"));
        assert_eq!(state["bob"][0].meta["status"], "away");
    }

    #[test]
    fn test_diff_before_snapshot_applies_to_empty() {
        let mut rec = PresenceReconciler::new();
        rec.handle_diff(&json!({
            "joins": {"carol": [{"presence_ref": "r3", "meta": {}}]},
            "leaves": {}
        }));
        assert!(rec.state().contains_key("carol"));
    }

    #[test]
    fn test_join_union_has_no_duplicate_refs() {
        let mut rec = PresenceReconciler::new();
        let diff = json!({
            "joins": {"alice": [{"presence_ref": "r1", "meta": {"v": 1}}]},
            "leaves": {}
        });
        rec.handle_diff(&diff);
        rec.handle_diff(&diff);
        assert_eq!(rec.state()["alice"].len(), 1);
    }

    #[test]
    fn test_multi_session_key_accumulates() {
        let mut rec = PresenceReconciler::new();
        rec.handle_diff(&json!({
            "joins": {"alice": [{"presence_ref": "r1", "meta": {}}]},
            "leaves": {}
        }));
        rec.handle_diff(&json!({
            "joins": {"alice": [{"presence_ref": "r2", "meta": {}}]},
            "leaves": {}
        }));
        assert_eq!(rec.state()["alice"].len(), 2);

        rec.handle_diff(&json!({
            "joins": {},
            "leaves": {"alice": [{"presence_ref": "r1"}]}
        }));
        let state = rec.state();
        assert_eq!(state["alice"].len(), 1);
        assert_eq!(state["alice"][0].presence_ref, "r2");
    }

    #[test]
    fn test_leave_of_unknown_ref_is_noop() {
        let mut rec = PresenceReconciler::new();
        let leaves = Arc::new(AtomicUsize::new(0));
        let l = leaves.clone();
        rec.on_leave(Box::new(move |_, _| {
            l.fetch_add(1, Ordering::SeqCst);
        }));
        rec.handle_diff(&json!({
            "joins": {},
            "leaves": {"ghost": [{"presence_ref": "nope"}]}
        }));
        assert_eq!(leaves.load(Ordering::SeqCst), 0);
    }
}
