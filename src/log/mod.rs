// src/log/mod.rs

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod kafka;
pub mod memory;
pub mod retry;

pub use kafka::KafkaLog;
pub use memory::MemoryLog;
pub use retry::{RetryPolicy, Transient};

/// Topic holding year-tagged batches of raw records.
pub const COMPUTE_TOPIC: &str = "compute";
/// Topic holding `year:codes` result records.
pub const RESULTS_TOPIC: &str = "results";

/// Consumer group used by the stage that reads `topic`.
pub fn group_for_topic(topic: &str) -> String {
    format!("{}-group", topic)
}

/// Partition routing key: SHA-256 of the payload. Never used for dedupe.
pub fn message_key(payload: &[u8]) -> Vec<u8> {
    Sha256::digest(payload).to_vec()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The log will deliver no more data to this consumer.
    #[error("log closed")]
    Closed,
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("transient log error: {0}")]
    Transient(String),
    #[error("log error: {0}")]
    Fatal(String),
}

impl LogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication,
        }
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl LogMessage {
    /// Payload as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    pub leader: String,
}

/// First/last offsets of a partition plus the group's committed position,
/// if the group has committed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffsets {
    pub partition: i32,
    pub first: i64,
    pub last: i64,
    pub committed: Option<i64>,
}

/// Pull side of a consumer-group subscription.
#[async_trait]
pub trait LogConsumer: Send {
    /// Waits until the next message is available. Returns `LogError::Closed`
    /// once the log signals it has no more data. Dropping the returned future
    /// before it completes loses no messages.
    async fn recv(&mut self) -> Result<LogMessage, LogError>;
}

/// Everything the pipeline needs from a durable partitioned log.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Creates the topic unless it already exists. Returns `true` when it was
    /// created; an existing topic is left untouched.
    async fn create_topic_if_absent(&self, spec: &TopicSpec) -> Result<bool, LogError>;

    /// One produce attempt. Retrying is the caller's decision.
    async fn produce(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), LogError>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, LogError>;

    /// All partitions of all topics, sorted by topic then partition id.
    async fn list_topics(&self) -> Result<Vec<PartitionInfo>, LogError>;

    /// Offsets for every partition of `topic`, sorted by partition id.
    async fn list_offsets(&self, topic: &str, group: &str)
        -> Result<Vec<PartitionOffsets>, LogError>;

    /// Per-topic outcome of a delete request.
    async fn delete_topics(
        &self,
        topics: &[String],
    ) -> Result<Vec<(String, Result<(), LogError>)>, LogError>;
}
