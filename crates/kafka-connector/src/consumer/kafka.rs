//! Kafka implementation of [`BrokerConsumer`] on top of rdkafka.

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use super::{BrokerConsumer, BrokerEvent, InboundMessage};
use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use crate::router::TopicWhitelist;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client context forwarding client errors and rebalances to the loop.
struct ConnectorContext {
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl ClientContext for ConnectorContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let event = if error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
            BrokerEvent::Fatal(format!("{error}: {reason}"))
        } else {
            BrokerEvent::Error(format!("{error}: {reason}"))
        };
        let _ = self.events.send(event);
    }
}

impl ConsumerContext for ConnectorContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let notification = match rebalance {
            Rebalance::Assign(partitions) => format!("assigned {}", describe(partitions)),
            Rebalance::Revoke(partitions) => format!("revoked {}", describe(partitions)),
            Rebalance::Error(e) => format!("rebalance error: {e}"),
        };
        let _ = self.events.send(BrokerEvent::Rebalance(notification));
    }
}

fn describe(partitions: &TopicPartitionList) -> String {
    let list: Vec<String> = partitions
        .elements()
        .iter()
        .map(|p| format!("{}[{}]", p.topic(), p.partition()))
        .collect();
    if list.is_empty() {
        "no partitions".to_owned()
    } else {
        list.join(", ")
    }
}

/// Consumer group member subscribed to the whitelist pattern.
///
/// Offsets are stored explicitly and committed in the background by the
/// client, so a stored offset is what the group resumes from.
pub struct KafkaConsumer {
    consumer: StreamConsumer<ConnectorContext>,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer").finish_non_exhaustive()
    }
}

impl KafkaConsumer {
    /// Joins the consumer group and subscribes to `whitelist`.
    pub fn new(config: &ConnectorConfig, whitelist: &TopicWhitelist) -> ConnectorResult<Self> {
        let (tx, events) = mpsc::unbounded_channel();

        let consumer: StreamConsumer<ConnectorContext> = client_config(config)
            .create_with_context(ConnectorContext { events: tx })?;

        let subscription = whitelist.subscription();
        consumer.subscribe(&[subscription.as_str()])?;

        info!(
            brokers = %config.brokers(),
            group_id = %config.group_id,
            subscription = %subscription,
            "Kafka consumer subscribed"
        );

        Ok(Self { consumer, events })
    }
}

fn client_config(config: &ConnectorConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers())
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", &config.consumer.initial_offset)
        .set(
            "session.timeout.ms",
            config.consumer.session_timeout.as_millis().to_string(),
        )
        .set(
            "heartbeat.interval.ms",
            config.consumer.heartbeat_interval.as_millis().to_string(),
        );
    client
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    )
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn next_event(&mut self) -> Option<BrokerEvent> {
        tokio::select! {
            Some(event) = self.events.recv() => Some(event),
            received = self.consumer.recv() => Some(match received {
                Ok(message) => BrokerEvent::Message(to_inbound(&message)),
                Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) => {
                    BrokerEvent::Fatal(e.to_string())
                }
                Err(e) => BrokerEvent::Error(e.to_string()),
            }),
        }
    }

    fn commit(&mut self, message: &InboundMessage) -> ConnectorResult<()> {
        // The stored offset is the next one the group should read.
        let mut partitions = TopicPartitionList::with_capacity(1);
        partitions.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.store_offsets(&partitions)?;
        Ok(())
    }

    fn redeliver(&mut self, message: &InboundMessage) -> ConnectorResult<()> {
        self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    fn pause(&mut self, topic: &str, partition: i32) -> ConnectorResult<()> {
        self.consumer.pause(&single_partition(topic, partition))?;
        Ok(())
    }

    fn resume(&mut self, topic: &str, partition: i32) -> ConnectorResult<()> {
        self.consumer.resume(&single_partition(topic, partition))?;
        Ok(())
    }
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut partitions = TopicPartitionList::with_capacity(1);
    partitions.add_partition(topic, partition);
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_from_connector_config() {
        let config = ConnectorConfig {
            broker_host: "k1:9092, k2:9092".to_owned(),
            ..ConnectorConfig::default()
        };
        let client = client_config(&config);

        assert_eq!(client.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(client.get("group.id"), Some("faas-kafka-queue-workers"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("session.timeout.ms"), Some("6000"));
        assert_eq!(client.get("heartbeat.interval.ms"), Some("2000"));
    }

    #[test]
    fn describe_empty_partition_list() {
        assert_eq!(describe(&TopicPartitionList::new()), "no partitions");
    }

    #[test]
    fn describe_partition_list() {
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition("faas-topics.orders", 0);
        partitions.add_partition("faas-topics.orders", 1);
        assert_eq!(
            describe(&partitions),
            "faas-topics.orders[0], faas-topics.orders[1]"
        );
    }
}
