use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{
    LogClient, LogConsumer, LogError, LogMessage, PartitionInfo, PartitionOffsets, TopicSpec,
};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// `LogClient` backed by a Kafka cluster through librdkafka.
pub struct KafkaLog {
    brokers: String,
    admin: AdminClient<DefaultClientContext>,
    producer: FutureProducer,
}

impl KafkaLog {
    /// Builds the admin and producer clients for a comma-separated broker list.
    /// librdkafka connects lazily, so an unreachable cluster surfaces on first use.
    pub fn connect(brokers: &str) -> Result<Self, LogError> {
        let admin: AdminClient<DefaultClientContext> = base_config(brokers)
            .create()
            .map_err(|e| LogError::Fatal(format!("creating admin client: {}", e)))?;
        let producer: FutureProducer = base_config(brokers)
            // retries are owned by the pipeline's RetryPolicy
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| LogError::Fatal(format!("creating producer: {}", e)))?;
        info!(brokers, "kafka clients created");
        Ok(Self {
            brokers: brokers.to_string(),
            admin,
            producer,
        })
    }

    async fn metadata_blocking<T, F>(&self, group: Option<&str>, f: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(BaseConsumer) -> Result<T, LogError> + Send + 'static,
    {
        let mut config = base_config(&self.brokers);
        if let Some(g) = group {
            config.set("group.id", g).set("enable.auto.commit", "false");
        }
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config.create().map_err(classify)?;
            f(consumer)
        })
        .await
        .map_err(|e| LogError::Fatal(format!("metadata task failed: {}", e)))?
    }
}

fn base_config(brokers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", brokers);
    config
}

/// Maps librdkafka errors onto the pipeline's retry classes.
fn classify(e: KafkaError) -> LogError {
    if let KafkaError::PartitionEOF(_) = e {
        return LogError::Closed;
    }
    match e.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition,
        ) => LogError::Transient(e.to_string()),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            LogError::UnknownTopic(e.to_string())
        }
        _ => LogError::Fatal(e.to_string()),
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn recv(&mut self) -> Result<LogMessage, LogError> {
        let m = self.consumer.recv().await.map_err(classify)?;
        Ok(LogMessage {
            topic: m.topic().to_string(),
            partition: m.partition(),
            offset: m.offset(),
            key: m.key().map(<[u8]>::to_vec),
            payload: m.payload().unwrap_or_default().to_vec(),
        })
    }
}

#[async_trait]
impl LogClient for KafkaLog {
    async fn create_topic_if_absent(&self, spec: &TopicSpec) -> Result<bool, LogError> {
        let name = spec.name.clone();
        let exists = self
            .metadata_blocking(None, move |c| {
                let md = c.fetch_metadata(None, QUERY_TIMEOUT).map_err(classify)?;
                Ok(md.topics().iter().any(|t| t.name() == name))
            })
            .await?;
        if exists {
            debug!(topic = %spec.name, "topic already exists");
            return Ok(false);
        }

        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        );
        let opts = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));
        let results = self
            .admin
            .create_topics(&[topic], &opts)
            .await
            .map_err(classify)?;
        for r in results {
            match r {
                Ok(t) => info!(topic = %t, partitions = spec.partitions, "created topic"),
                // lost a race with another creator
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => return Ok(false),
                Err((t, code)) => {
                    return Err(LogError::Fatal(format!("creating topic {}: {}", t, code)))
                }
            }
        }
        Ok(true)
    }

    async fn produce(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), LogError> {
        let record = FutureRecord::to(topic).key(key).payload(value);
        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map(|_| ())
            .map_err(|(e, _)| classify(e))
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, LogError> {
        let consumer: StreamConsumer = base_config(&self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(classify)?;
        consumer.subscribe(&[topic]).map_err(classify)?;
        info!(topic, group, "subscribed");
        Ok(Box::new(KafkaConsumer { consumer }))
    }

    async fn list_topics(&self) -> Result<Vec<PartitionInfo>, LogError> {
        self.metadata_blocking(None, |c| {
            let md = c.fetch_metadata(None, QUERY_TIMEOUT).map_err(classify)?;
            let leader_host = |id: i32| {
                md.brokers()
                    .iter()
                    .find(|b| b.id() == id)
                    .map(|b| format!("{}:{}", b.host(), b.port()))
                    .unwrap_or_else(|| format!("broker-{}", id))
            };
            let mut out: Vec<PartitionInfo> = md
                .topics()
                .iter()
                .flat_map(|t| {
                    t.partitions().iter().map(move |p| PartitionInfo {
                        topic: t.name().to_string(),
                        partition: p.id(),
                        leader: leader_host(p.leader()),
                    })
                })
                .collect();
            out.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.partition.cmp(&b.partition)));
            Ok(out)
        })
        .await
    }

    async fn list_offsets(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<PartitionOffsets>, LogError> {
        let topic = topic.to_string();
        self.metadata_blocking(Some(group), move |c| {
            let md = c
                .fetch_metadata(Some(&topic), QUERY_TIMEOUT)
                .map_err(classify)?;
            let meta = md
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .filter(|t| !t.partitions().is_empty())
                .ok_or_else(|| LogError::UnknownTopic(topic.clone()))?;
            let mut ids: Vec<i32> = meta.partitions().iter().map(|p| p.id()).collect();
            ids.sort_unstable();

            let mut tpl = TopicPartitionList::new();
            for id in &ids {
                tpl.add_partition(&topic, *id);
            }
            let committed = c.committed_offsets(tpl, QUERY_TIMEOUT).map_err(classify)?;

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let (first, last) = c
                    .fetch_watermarks(&topic, id, QUERY_TIMEOUT)
                    .map_err(classify)?;
                let committed = committed
                    .find_partition(&topic, id)
                    .and_then(|e| match e.offset() {
                        Offset::Offset(o) => Some(o),
                        _ => None,
                    });
                out.push(PartitionOffsets {
                    partition: id,
                    first,
                    last,
                    committed,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn delete_topics(
        &self,
        topics: &[String],
    ) -> Result<Vec<(String, Result<(), LogError>)>, LogError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        let opts = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));
        let results = self
            .admin
            .delete_topics(&names, &opts)
            .await
            .map_err(classify)?;
        Ok(results
            .into_iter()
            .map(|r| match r {
                Ok(t) => (t, Ok(())),
                Err((t, code)) => {
                    let err = match code {
                        RDKafkaErrorCode::UnknownTopicOrPartition => {
                            LogError::UnknownTopic(t.clone())
                        }
                        other => LogError::Fatal(other.to_string()),
                    };
                    (t, Err(err))
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_eof_means_closed() {
        assert_eq!(classify(KafkaError::PartitionEOF(0)), LogError::Closed);
    }

    #[test]
    fn broker_outages_are_transient() {
        let e = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert!(classify(e).is_transient());
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown);
        assert!(classify(e).is_transient());
    }

    #[test]
    fn unknown_topics_are_reported_as_such() {
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(matches!(classify(e), LogError::UnknownTopic(_)));
    }

    #[test]
    fn other_errors_are_fatal() {
        let e = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(classify(e), LogError::Fatal(_)));
    }
}
