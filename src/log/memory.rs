use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    LogClient, LogConsumer, LogError, LogMessage, PartitionInfo, PartitionOffsets, TopicSpec,
};

/// In-process partitioned log with consumer-group cursors.
///
/// Messages are routed to a partition by hashing their key. Every consumer
/// subscribed under the same group shares one cursor per partition, so each
/// message is delivered once per group. `close_topic` marks a topic finite:
/// consumers drain what is left and then receive `LogError::Closed`.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<BTreeMap<String, Topic>>,
    arrivals: Notify,
}

struct Topic {
    partitions: Vec<Vec<Stored>>,
    /// group -> next offset per partition
    cursors: HashMap<String, Vec<i64>>,
    closed: bool,
}

struct Stored {
    key: Vec<u8>,
    payload: Vec<u8>,
}

impl Topic {
    fn new(partitions: i32) -> Self {
        let n = partitions.max(1) as usize;
        Self {
            partitions: (0..n).map(|_| Vec::new()).collect(),
            cursors: HashMap::new(),
            closed: false,
        }
    }

    fn route(&self, key: &[u8]) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() % self.partitions.len() as u64) as usize
    }

    /// Takes the next undelivered message for `group`, lowest partition first.
    fn next_for(&mut self, name: &str, group: &str) -> Option<LogMessage> {
        let n = self.partitions.len();
        let cursor = self
            .cursors
            .entry(group.to_string())
            .or_insert_with(|| vec![0; n]);
        for (p, messages) in self.partitions.iter().enumerate() {
            let offset = cursor[p];
            if let Some(m) = messages.get(offset as usize) {
                cursor[p] += 1;
                return Some(LogMessage {
                    topic: name.to_string(),
                    partition: p as i32,
                    offset,
                    key: Some(m.key.clone()),
                    payload: m.payload.clone(),
                });
            }
        }
        None
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, BTreeMap<String, Topic>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals end-of-stream on `topic`. Consumers see `LogError::Closed`
    /// after draining the remaining messages.
    pub fn close_topic(&self, topic: &str) -> Result<(), LogError> {
        {
            let mut topics = self.topics();
            let t = topics
                .get_mut(topic)
                .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
            t.closed = true;
        }
        debug!(topic, "memory log topic closed");
        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    /// Number of messages stored across all partitions of `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|t| t.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Payloads of `topic` in partition order, without moving any cursor.
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics()
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .flat_map(|p| p.iter().map(|m| m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct MemoryConsumer {
    log: MemoryLog,
    topic: String,
    group: String,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Result<LogMessage, LogError> {
        loop {
            // register interest before looking so a produce between the
            // check and the await still wakes us
            let notified = self.log.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut topics = self.log.topics();
                let t = topics
                    .get_mut(&self.topic)
                    .ok_or_else(|| LogError::UnknownTopic(self.topic.clone()))?;
                if let Some(m) = t.next_for(&self.topic, &self.group) {
                    return Ok(m);
                }
                if t.closed {
                    return Err(LogError::Closed);
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl LogClient for MemoryLog {
    async fn create_topic_if_absent(&self, spec: &TopicSpec) -> Result<bool, LogError> {
        let mut topics = self.topics();
        if topics.contains_key(&spec.name) {
            return Ok(false);
        }
        topics.insert(spec.name.clone(), Topic::new(spec.partitions));
        Ok(true)
    }

    async fn produce(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), LogError> {
        {
            let mut topics = self.topics();
            let t = topics
                .get_mut(topic)
                .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
            if t.closed {
                return Err(LogError::Fatal(format!("topic {} is closed", topic)));
            }
            let p = t.route(key);
            t.partitions[p].push(Stored {
                key: key.to_vec(),
                payload: value.to_vec(),
            });
        }
        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, LogError> {
        if !self.topics().contains_key(topic) {
            return Err(LogError::UnknownTopic(topic.to_string()));
        }
        Ok(Box::new(MemoryConsumer {
            log: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }

    async fn list_topics(&self) -> Result<Vec<PartitionInfo>, LogError> {
        Ok(self
            .topics()
            .iter()
            .flat_map(|(name, t)| {
                (0..t.partitions.len()).map(move |p| PartitionInfo {
                    topic: name.clone(),
                    partition: p as i32,
                    leader: "memory".to_string(),
                })
            })
            .collect())
    }

    async fn list_offsets(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<PartitionOffsets>, LogError> {
        let topics = self.topics();
        let t = topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        let cursor = t.cursors.get(group);
        Ok(t.partitions
            .iter()
            .enumerate()
            .map(|(p, messages)| PartitionOffsets {
                partition: p as i32,
                first: 0,
                last: messages.len() as i64,
                committed: cursor.map(|c| c[p]),
            })
            .collect())
    }

    async fn delete_topics(
        &self,
        topics: &[String],
    ) -> Result<Vec<(String, Result<(), LogError>)>, LogError> {
        let mut existing = self.topics();
        let outcome = topics
            .iter()
            .map(|name| {
                let r = match existing.remove(name) {
                    Some(_) => Ok(()),
                    None => Err(LogError::UnknownTopic(name.clone())),
                };
                (name.clone(), r)
            })
            .collect();
        drop(existing);
        // wake consumers of deleted topics so they observe UnknownTopic
        self.inner.arrivals.notify_waiters();
        Ok(outcome)
    }
}
