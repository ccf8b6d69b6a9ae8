//! Republishing of function responses onto the broker.
//!
//! A function opts in by carrying an output-topic annotation (`writer` by
//! default). Its successful, non-empty response body is sent to that topic.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ProducerSettings;
use crate::error::{ConnectorError, ConnectorResult};
use crate::invoker::InvocationOutcome;
use crate::registry::FunctionRegistry;

/// Destination for republished responses.
#[async_trait]
pub trait ResponseSink: Send + Sync + std::fmt::Debug {
    /// Sends `payload` to `topic` and waits for the acknowledgement.
    async fn publish(&self, topic: &str, payload: &[u8]) -> ConnectorResult<()>;
}

/// Sink that opens a short-lived Kafka producer for every response.
#[derive(Debug, Clone)]
pub struct KafkaResponseSink {
    brokers: String,
    settings: ProducerSettings,
}

impl KafkaResponseSink {
    pub fn new(brokers: impl Into<String>, settings: ProducerSettings) -> Self {
        Self {
            brokers: brokers.into(),
            settings,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("acks", &self.settings.acks)
            .set("retries", self.settings.retries.to_string())
            .set(
                "message.timeout.ms",
                self.settings.timeout.as_millis().to_string(),
            );
        config
    }
}

#[async_trait]
impl ResponseSink for KafkaResponseSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> ConnectorResult<()> {
        let producer: FutureProducer = self.client_config().create()?;
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);

        let delivery = producer
            .send(record, Timeout::After(self.settings.timeout))
            .await
            .map_err(|(e, _)| ConnectorError::publish(e.to_string()))?;

        debug!(topic, delivery = ?delivery, "Response delivered");
        Ok(())
    }
}

/// Why a response was not republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvocationFailed,
    NoBody,
    UnknownFunction,
    NoWriter,
}

/// What happened to one invocation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published { topic: String },
    Skipped(SkipReason),
    Failed { topic: String, error: String },
}

/// Republishes function responses according to the function's annotations.
#[derive(Debug)]
pub struct ResponsePublisher {
    registry: Arc<FunctionRegistry>,
    sink: Arc<dyn ResponseSink>,
    writer_annotation: String,
}

impl ResponsePublisher {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        sink: Arc<dyn ResponseSink>,
        writer_annotation: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            sink,
            writer_annotation: writer_annotation.into(),
        }
    }

    /// Publishes the outcome's body if its function asks for it.
    ///
    /// The function is looked up in the registry's current snapshot, so a
    /// function removed since dispatch started is skipped.
    pub async fn handle(&self, outcome: &InvocationOutcome) -> PublishResult {
        let function = outcome.function.as_str();

        if !outcome.success {
            return skipped(function, SkipReason::InvocationFailed);
        }
        let Some(body) = outcome.body.as_deref() else {
            return skipped(function, SkipReason::NoBody);
        };
        let Some(descriptor) = self.registry.snapshot().get(function) else {
            return skipped(function, SkipReason::UnknownFunction);
        };
        let Some(topic) = descriptor.annotation(&self.writer_annotation) else {
            return skipped(function, SkipReason::NoWriter);
        };

        match self.sink.publish(topic, body).await {
            Ok(()) => {
                info!(function, topic, bytes = body.len(), "Function response written");
                PublishResult::Published {
                    topic: topic.to_owned(),
                }
            }
            Err(e) => {
                warn!(
                    function,
                    topic,
                    error = %e,
                    error_type = e.error_type(),
                    "Function response write failed"
                );
                PublishResult::Failed {
                    topic: topic.to_owned(),
                    error: e.to_string(),
                }
            }
        }
    }
}

fn skipped(function: &str, reason: SkipReason) -> PublishResult {
    debug!(function, reason = ?reason, "Ignoring response of function");
    PublishResult::Skipped(reason)
}
