use std::sync::Arc;

use tracing::debug;

use crate::log::{message_key, LogClient, LogError, RetryPolicy};

/// Where a stage sends what it produces.
#[derive(Clone)]
pub enum Sink {
    /// Produce to a topic, retrying transient failures per `retry`.
    Log {
        client: Arc<dyn LogClient>,
        topic: String,
        retry: RetryPolicy,
    },
    /// Echo to stdout, prefixed with `label`.
    Stdout { label: &'static str },
    Discard,
}

impl Sink {
    pub fn log(client: Arc<dyn LogClient>, topic: impl Into<String>, retry: RetryPolicy) -> Self {
        Sink::Log {
            client,
            topic: topic.into(),
            retry,
        }
    }

    pub async fn emit(&self, payload: &[u8]) -> Result<(), LogError> {
        match self {
            Sink::Log {
                client,
                topic,
                retry,
            } => {
                let key = message_key(payload);
                debug!(topic = %topic, key = %hex::encode(&key), "writing message");
                retry
                    .run("produce", || client.produce(topic, &key, payload))
                    .await
            }
            Sink::Stdout { label } => {
                println!("{}: {}", label, String::from_utf8_lossy(payload));
                Ok(())
            }
            Sink::Discard => Ok(()),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Log { topic, .. } => write!(f, "Sink::Log({})", topic),
            Sink::Stdout { .. } => f.write_str("Sink::Stdout"),
            Sink::Discard => f.write_str("Sink::Discard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MemoryLog, TopicSpec};

    #[tokio::test]
    async fn log_sink_keys_messages_by_checksum() {
        let log = MemoryLog::new();
        log.create_topic_if_absent(&TopicSpec::new("out", 1, 1))
            .await
            .unwrap();
        let sink = Sink::log(Arc::new(log.clone()), "out", RetryPolicy::NONE);
        sink.emit(b"2020:1,2").await.unwrap();

        let mut c = log.subscribe("out", "g").await.unwrap();
        let m = c.recv().await.unwrap();
        assert_eq!(m.text(), "2020:1,2");
        assert_eq!(m.key, Some(message_key(b"2020:1,2")));
    }

    #[tokio::test]
    async fn log_sink_surfaces_produce_failures() {
        let sink = Sink::log(Arc::new(MemoryLog::new()), "missing", RetryPolicy::NONE);
        assert!(matches!(
            sink.emit(b"x").await,
            Err(LogError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn discard_accepts_everything() {
        assert!(Sink::Discard.emit(b"anything").await.is_ok());
    }
}
