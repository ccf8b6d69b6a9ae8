//! Test fixtures for connector integration tests.

use kafka_connector::consumer::{BrokerEvent, InboundMessage};
use kafka_connector::registry::FunctionDescriptor;
use std::collections::BTreeMap;

pub const GATEWAY_URL: &str = "http://gateway:8080";

/// Builder for creating test FunctionDescriptor instances.
pub struct FunctionBuilder {
    name: String,
    gateway_url: String,
    annotations: BTreeMap<String, String>,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gateway_url: GATEWAY_URL.to_string(),
            annotations: BTreeMap::new(),
        }
    }

    /// Subscribes the function to the given topics via the `topic` annotation.
    pub fn with_topics(mut self, topics: &str) -> Self {
        self.annotations.insert("topic".to_string(), topics.to_string());
        self
    }

    /// Sets the output topic via the `writer` annotation.
    pub fn with_writer(mut self, topic: &str) -> Self {
        self.annotations.insert("writer".to_string(), topic.to_string());
        self
    }

    pub fn with_gateway(mut self, gateway_url: &str) -> Self {
        self.gateway_url = gateway_url.to_string();
        self
    }

    pub fn build(self) -> FunctionDescriptor {
        FunctionDescriptor::new(self.name, &self.gateway_url, self.annotations)
    }
}

pub fn message(topic: &str, offset: i64, payload: &[u8]) -> InboundMessage {
    InboundMessage::new(topic, 0, offset, payload.to_vec())
}

pub fn delivered(topic: &str, offset: i64, payload: &[u8]) -> BrokerEvent {
    BrokerEvent::Message(message(topic, offset, payload))
}
