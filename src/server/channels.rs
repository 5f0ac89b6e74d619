//! Channel registry: topic membership and broadcast fan-out.

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::limits;
use crate::protocol::ChannelConfig;

use super::EngineMetrics;

/// One successful join: a link's membership in a topic.
#[derive(Clone)]
pub(crate) struct ChannelMember {
    pub conn_id: String,
    pub join_seq: String,
    pub config: ChannelConfig,
    pub tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum JoinError {
    AlreadyJoined,
    ChannelFull,
    TooManySubscriptions,
}

/// Topic -> member set, with a reverse index for disconnect cleanup.
pub(crate) struct ChannelRegistry {
    topics: DashMap<String, DashMap<String, ChannelMember>>,
    conn_topics: DashMap<String, DashSet<String>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            conn_topics: DashMap::new(),
        }
    }

    pub fn join(&self, topic: &str, member: ChannelMember) -> Result<(), JoinError> {
        let subs = self.conn_topics.entry(member.conn_id.clone()).or_default();
        if subs.len() >= limits::MAX_SUBSCRIPTIONS_PER_CONN && !subs.contains(topic) {
            return Err(JoinError::TooManySubscriptions);
        }

        let members = self.topics.entry(topic.to_owned()).or_default();
        if members.contains_key(&member.conn_id) {
            return Err(JoinError::AlreadyJoined);
        }
        if members.len() >= limits::MAX_MEMBERS_PER_CHANNEL {
            return Err(JoinError::ChannelFull);
        }
        subs.insert(topic.to_owned());
        members.insert(member.conn_id.clone(), member);
        Ok(())
    }

    /// Remove one membership. Drops the topic entry when it empties.
    pub fn leave(&self, topic: &str, conn_id: &str) -> bool {
        let removed = match self.topics.get(topic) {
            Some(members) => members.remove(conn_id).is_some(),
            None => false,
        };
        if removed {
            if let Some(subs) = self.conn_topics.get(conn_id) {
                subs.remove(topic);
            }
            // remove_if prevents racing a concurrent join on the same topic.
            self.topics.remove_if(topic, |_, members| members.is_empty());
        }
        removed
    }

    /// Drop a whole topic. Returns the former members' connection ids.
    pub fn drop_topic(&self, topic: &str) -> Vec<String> {
        match self.topics.remove(topic) {
            Some((_, members)) => {
                let conn_ids: Vec<String> =
                    members.into_iter().map(|(conn_id, _)| conn_id).collect();
                for conn_id in &conn_ids {
                    if let Some(subs) = self.conn_topics.get(conn_id) {
                        subs.remove(topic);
                    }
                }
                conn_ids
            }
            None => Vec::new(),
        }
    }

    /// Drop every membership owned by a link. Returns the topics it was in.
    pub fn remove_connection(&self, conn_id: &str) -> Vec<String> {
        let mut left = Vec::new();
        if let Some((_, topics)) = self.conn_topics.remove(conn_id) {
            for topic_ref in topics.iter() {
                let topic = topic_ref.clone();
                if let Some(members) = self.topics.get(&topic) {
                    if members.remove(conn_id).is_some() {
                        left.push(topic.clone());
                    }
                }
                self.topics.remove_if(&topic, |_, members| members.is_empty());
            }
        }
        left
    }

    pub fn is_member(&self, topic: &str, conn_id: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.contains_key(conn_id))
    }

    pub fn member_config(&self, topic: &str, conn_id: &str) -> Option<ChannelConfig> {
        self.topics
            .get(topic)?
            .get(conn_id)
            .map(|m| m.config.clone())
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn members_of(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|members| members.iter().map(|m| m.conn_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |m| m.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn total_members(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }

    /// Snapshot the recipient senders for a topic. Membership changes after
    /// this call do not affect an in-flight fan-out.
    pub fn collect_senders(
        &self,
        topic: &str,
        exclude: Option<&str>,
    ) -> Vec<mpsc::UnboundedSender<Message>> {
        let mut senders = Vec::new();
        if let Some(members) = self.topics.get(topic) {
            senders.reserve(members.len());
            for member in members.iter() {
                if exclude == Some(member.conn_id.as_str()) {
                    continue;
                }
                senders.push(member.tx.clone());
            }
        }
        senders
    }

    /// Serialize-once fan-out. Send failures are counted, never fatal.
    /// Returns the number of links the frame was handed to.
    pub fn fanout(
        &self,
        topic: &str,
        text: &str,
        exclude: Option<&str>,
        metrics: &EngineMetrics,
    ) -> usize {
        let senders = self.collect_senders(topic, exclude);
        fanout_to_senders(senders, text, metrics)
    }
}

/// Hand one serialized frame to a set of link writers.
pub(crate) fn fanout_to_senders(
    senders: Vec<mpsc::UnboundedSender<Message>>,
    text: &str,
    metrics: &EngineMetrics,
) -> usize {
    use std::sync::atomic::Ordering;

    if senders.is_empty() {
        return 0;
    }
    // One serialization, one refcounted buffer for every recipient.
    let shared: tokio_tungstenite::tungstenite::Utf8Bytes = text.to_owned().into();
    let mut delivered = 0usize;
    let mut dropped = 0u64;
    for tx in &senders {
        if tx.send(Message::Text(shared.clone())).is_ok() {
            delivered += 1;
        } else {
            dropped += 1;
        }
    }
    metrics
        .broadcasts_delivered
        .fetch_add(delivered as u64, Ordering::Relaxed);
    if dropped > 0 {
        metrics.broadcasts_dropped.fetch_add(dropped, Ordering::Relaxed);
        tracing::debug!(dropped, "fan-out hit closed link writers");
    }
    delivered
}
