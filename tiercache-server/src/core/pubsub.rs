use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::StoreError;

pub type SubscriberId = String;

/// Channel feeding one WebSocket connection
pub type MessageSender = mpsc::UnboundedSender<Message>;

/// Topic router for invalidation broadcasts
///
/// Topics are dot-separated. A subscription is either an exact topic or a
/// pattern where `*` matches one segment and a trailing `#` matches the rest.
#[derive(Clone)]
pub struct TopicRouter {
    topics: Arc<RwLock<Trie<String, HashSet<SubscriberId>>>>,
    wildcard_subs: Arc<RwLock<Vec<WildcardSubscription>>>,
    connections: Arc<RwLock<HashMap<SubscriberId, MessageSender>>>,
    stats: Arc<RwLock<RouterStats>>,
}

#[derive(Clone)]
struct WildcardSubscription {
    pattern: String,
    subscriber_id: SubscriberId,
    matcher: WildcardMatcher,
}

/// Compiled wildcard pattern
#[derive(Clone, Debug)]
pub struct WildcardMatcher {
    segments: Vec<SegmentMatcher>,
}

#[derive(Clone, Debug, PartialEq)]
enum SegmentMatcher {
    Exact(String),
    SingleLevel,
    MultiLevel,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub total_topics: usize,
    pub total_subscribers: usize,
    pub total_wildcard_subscriptions: usize,
    pub messages_published: u64,
    pub messages_delivered: u64,
}

/// Message pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResult {
    pub subscriber_id: SubscriberId,
    pub topics: Vec<String>,
    pub subscription_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub message_id: String,
    pub topic: String,
    pub subscribers_matched: usize,
    pub delivered: usize,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(Trie::new())),
            wildcard_subs: Arc::new(RwLock::new(Vec::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RouterStats::default())),
        }
    }

    pub fn register_connection(&self, subscriber_id: String, sender: MessageSender) {
        debug!("WebSocket connection registered for subscriber: {}", subscriber_id);
        self.connections.write().insert(subscriber_id, sender);
    }

    pub fn unregister_connection(&self, subscriber_id: &str) {
        self.connections.write().remove(subscriber_id);
        debug!("WebSocket connection unregistered for subscriber: {}", subscriber_id);
    }

    /// Subscribe a new subscriber to `topics`, all or nothing
    pub fn subscribe(&self, topics: Vec<String>) -> Result<SubscribeResult, StoreError> {
        if topics.is_empty() {
            return Err(StoreError::InvalidRequest(
                "At least one topic required".to_string(),
            ));
        }

        // compile everything first so a bad pattern subscribes nothing
        let mut compiled = Vec::with_capacity(topics.len());
        for topic in &topics {
            if topic.is_empty() {
                return Err(StoreError::InvalidPattern("empty topic".to_string()));
            }
            let matcher = if is_wildcard_pattern(topic) {
                Some(WildcardMatcher::compile(topic)?)
            } else {
                None
            };
            compiled.push((topic.clone(), matcher));
        }

        let subscriber_id = Uuid::new_v4().to_string();
        for (topic, matcher) in compiled {
            match matcher {
                Some(matcher) => {
                    debug!("Subscriber {} added wildcard pattern: {}", subscriber_id, topic);
                    self.wildcard_subs.write().push(WildcardSubscription {
                        pattern: topic,
                        subscriber_id: subscriber_id.clone(),
                        matcher,
                    });
                }
                None => {
                    debug!("Subscriber {} added to topic: {}", subscriber_id, topic);
                    let mut topics_map = self.topics.write();
                    if let Some(subscribers) = topics_map.get_mut(&topic) {
                        subscribers.insert(subscriber_id.clone());
                    } else {
                        topics_map.insert(topic, HashSet::from([subscriber_id.clone()]));
                    }
                }
            }
        }

        self.update_stats();

        Ok(SubscribeResult {
            subscriber_id,
            subscription_count: topics.len(),
            topics,
        })
    }

    /// Drop every subscription held by `subscriber_id`
    pub fn unsubscribe(&self, subscriber_id: &str) -> usize {
        let mut unsubscribed = 0;

        {
            let mut topics_map = self.topics.write();
            let keys: Vec<String> = topics_map.keys().cloned().collect();
            for key in keys {
                let now_empty = match topics_map.get_mut(&key) {
                    Some(subscribers) => {
                        if subscribers.remove(subscriber_id) {
                            unsubscribed += 1;
                        }
                        subscribers.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    topics_map.remove(&key);
                }
            }
        }

        {
            let mut wildcards = self.wildcard_subs.write();
            let before = wildcards.len();
            wildcards.retain(|sub| sub.subscriber_id != subscriber_id);
            unsubscribed += before - wildcards.len();
        }

        self.update_stats();

        debug!("Subscriber {} unsubscribed from {} topics", subscriber_id, unsubscribed);
        unsubscribed
    }

    /// Publish `payload` to every exact and wildcard subscriber of `topic`
    pub fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<PublishResult, StoreError> {
        if topic.is_empty() {
            return Err(StoreError::InvalidValue("Topic cannot be empty".to_string()));
        }
        if is_wildcard_pattern(topic) {
            return Err(StoreError::InvalidValue(format!(
                "cannot publish to a pattern: {}",
                topic
            )));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            timestamp: current_timestamp(),
        };

        let mut subscribers = self.find_exact_subscribers(topic);
        subscribers.extend(self.find_wildcard_subscribers(topic));
        let matched = subscribers.len();

        let delivered = self.deliver_message(&message, &subscribers);

        {
            let mut stats = self.stats.write();
            stats.messages_published += 1;
            stats.messages_delivered += delivered as u64;
        }

        debug!(
            "Published message {} to topic {} ({}/{} subscribers)",
            message.id, topic, delivered, matched
        );

        Ok(PublishResult {
            message_id: message.id,
            topic: message.topic,
            subscribers_matched: matched,
            delivered,
        })
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.read().clone()
    }

    /// Exact topics plus wildcard patterns currently subscribed
    pub fn list_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        let wildcards = self.wildcard_subs.read();
        for sub in wildcards.iter() {
            if !topics.contains(&sub.pattern) {
                topics.push(sub.pattern.clone());
            }
        }
        topics
    }

    fn find_exact_subscribers(&self, topic: &str) -> HashSet<SubscriberId> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    fn find_wildcard_subscribers(&self, topic: &str) -> HashSet<SubscriberId> {
        let topic_segments: Vec<&str> = topic.split('.').collect();
        self.wildcard_subs
            .read()
            .iter()
            .filter(|sub| sub.matcher.matches(&topic_segments))
            .map(|sub| sub.subscriber_id.clone())
            .collect()
    }

    fn update_stats(&self) {
        let topics_map = self.topics.read();
        let wildcards = self.wildcard_subs.read();

        let exact_subscribers: usize = topics_map.values().map(HashSet::len).sum();

        let mut stats = self.stats.write();
        stats.total_topics = topics_map.len();
        stats.total_subscribers = exact_subscribers + wildcards.len();
        stats.total_wildcard_subscriptions = wildcards.len();
    }

    fn deliver_message(&self, message: &Message, subscribers: &HashSet<SubscriberId>) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;

        for sub_id in subscribers {
            if let Some(sender) = connections.get(sub_id) {
                if sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    warn!("Failed to deliver message to subscriber: {}", sub_id);
                }
            }
        }

        delivered
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_wildcard_pattern(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('#')
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl WildcardMatcher {
    pub fn compile(pattern: &str) -> Result<Self, StoreError> {
        let segments: Vec<SegmentMatcher> = pattern
            .split('.')
            .map(|seg| match seg {
                "*" => SegmentMatcher::SingleLevel,
                "#" => SegmentMatcher::MultiLevel,
                s => SegmentMatcher::Exact(s.to_string()),
            })
            .collect();

        let multi_level_count = segments
            .iter()
            .filter(|s| matches!(s, SegmentMatcher::MultiLevel))
            .count();
        if multi_level_count > 1 {
            return Err(StoreError::InvalidPattern(format!(
                "{}: only one # wildcard allowed",
                pattern
            )));
        }
        if multi_level_count == 1 && segments.last() != Some(&SegmentMatcher::MultiLevel) {
            return Err(StoreError::InvalidPattern(format!(
                "{}: # wildcard must be the last segment",
                pattern
            )));
        }
        if let Some(SegmentMatcher::Exact(seg)) = segments
            .iter()
            .find(|s| matches!(s, SegmentMatcher::Exact(e) if e.contains('*') || e.contains('#')))
        {
            return Err(StoreError::InvalidPattern(format!(
                "{}: wildcards must fill a whole segment, found {}",
                pattern, seg
            )));
        }

        Ok(Self { segments })
    }

    pub fn matches(&self, topic_segments: &[&str]) -> bool {
        let mut seg_idx = 0;

        for matcher in &self.segments {
            match matcher {
                SegmentMatcher::Exact(s) => {
                    if topic_segments.get(seg_idx) != Some(&s.as_str()) {
                        return false;
                    }
                    seg_idx += 1;
                }
                SegmentMatcher::SingleLevel => {
                    if seg_idx >= topic_segments.len() {
                        return false;
                    }
                    seg_idx += 1;
                }
                // compile() keeps # last
                SegmentMatcher::MultiLevel => return true,
            }
        }

        seg_idx == topic_segments.len()
    }
}
