//! Common test utilities for connector integration tests.

#![allow(dead_code)]

pub mod fixtures;

use async_trait::async_trait;
use kafka_connector::consumer::{
    BrokerConsumer, BrokerEvent, ConsumerLoop, InboundMessage, LoopSettings,
};
use kafka_connector::dispatch::Dispatcher;
use kafka_connector::error::{ConnectorError, ConnectorResult};
use kafka_connector::invoker::{FunctionInvoker, InvocationOutcome};
use kafka_connector::publisher::{ResponsePublisher, ResponseSink};
use kafka_connector::registry::{FunctionDescriptor, FunctionRegistry};
use kafka_connector::router::TopicRouter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One step of a scripted broker session.
#[derive(Debug)]
pub enum Step {
    Deliver(BrokerEvent),
    /// Replaces the registry contents before the next event is delivered.
    Install(Vec<FunctionDescriptor>),
}

/// Offsets the loop committed or asked to redeliver, and partition pauses.
#[derive(Debug, Default)]
pub struct OffsetLog {
    pub committed: Vec<(String, i64)>,
    pub redelivered: Vec<(String, i64)>,
    pub paused: Vec<(String, i32)>,
    pub resumed: Vec<(String, i32)>,
}

/// Broker consumer replaying a fixed script.
#[derive(Debug)]
pub struct ScriptedConsumer {
    steps: VecDeque<Step>,
    registry: Arc<FunctionRegistry>,
    log: Arc<Mutex<OffsetLog>>,
    hold_open: bool,
}

#[async_trait]
impl BrokerConsumer for ScriptedConsumer {
    async fn next_event(&mut self) -> Option<BrokerEvent> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Deliver(event) => return Some(event),
                Step::Install(functions) => {
                    self.registry.install(functions);
                }
            }
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        None
    }

    fn commit(&mut self, message: &InboundMessage) -> ConnectorResult<()> {
        self.log
            .lock()
            .committed
            .push((message.topic.clone(), message.offset));
        Ok(())
    }

    fn redeliver(&mut self, message: &InboundMessage) -> ConnectorResult<()> {
        self.log
            .lock()
            .redelivered
            .push((message.topic.clone(), message.offset));
        Ok(())
    }

    fn pause(&mut self, topic: &str, partition: i32) -> ConnectorResult<()> {
        self.log.lock().paused.push((topic.to_string(), partition));
        Ok(())
    }

    fn resume(&mut self, topic: &str, partition: i32) -> ConnectorResult<()> {
        self.log.lock().resumed.push((topic.to_string(), partition));
        Ok(())
    }
}

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Invoker recording every call and answering from a table.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<Invocation>>,
    responses: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingInvoker {
    /// Makes `function` answer with `body`.
    pub fn respond(&self, function: &str, body: &[u8]) {
        self.responses
            .lock()
            .insert(function.to_string(), body.to_vec());
    }

    /// Makes every invocation of `function` fail with status 500.
    pub fn fail(&self, function: &str) {
        self.failing.lock().insert(function.to_string());
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Most invocations observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, function: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.function == function)
            .count()
    }
}

#[async_trait]
impl FunctionInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        function: &FunctionDescriptor,
        message: &InboundMessage,
    ) -> InvocationOutcome {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().push(Invocation {
            function: function.name.clone(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
        });

        if self.failing.lock().contains(&function.name) {
            return InvocationOutcome::failed(
                &function.name,
                &message.topic,
                Some(500),
                "function returned status 500",
            );
        }

        let body = self
            .responses
            .lock()
            .get(&function.name)
            .cloned()
            .unwrap_or_default();
        InvocationOutcome::succeeded(&function.name, &message.topic, 200, body)
    }
}

/// Response sink keeping published records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(String, Vec<u8>)>>,
    fail: Mutex<bool>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<(String, Vec<u8>)> {
        self.records.lock().clone()
    }

    pub fn fail_all(&self) {
        *self.fail.lock() = true;
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> ConnectorResult<()> {
        if *self.fail.lock() {
            return Err(ConnectorError::publish("broker unavailable"));
        }
        self.records
            .lock()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Connector components wired together around in-memory fakes.
pub struct TestConnector {
    pub registry: Arc<FunctionRegistry>,
    pub invoker: Arc<RecordingInvoker>,
    pub sink: Arc<MemorySink>,
    pub offsets: Arc<Mutex<OffsetLog>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(FunctionRegistry::new()),
            invoker: Arc::new(RecordingInvoker::default()),
            sink: Arc::new(MemorySink::default()),
            offsets: Arc::new(Mutex::new(OffsetLog::default())),
        }
    }

    /// Creates a connector whose registry already holds `functions`.
    pub fn with_functions(functions: Vec<FunctionDescriptor>) -> Self {
        let connector = Self::new();
        connector.registry.install(functions);
        connector
    }

    pub fn dispatcher(&self) -> Dispatcher {
        let publisher = Arc::new(ResponsePublisher::new(
            Arc::clone(&self.registry),
            self.sink.clone(),
            "writer",
        ));
        Dispatcher::new(self.invoker.clone(), publisher)
    }

    /// Consumer replaying `steps`, then ending the stream.
    pub fn consumer(&self, steps: Vec<Step>) -> ScriptedConsumer {
        ScriptedConsumer {
            steps: steps.into(),
            registry: Arc::clone(&self.registry),
            log: Arc::clone(&self.offsets),
            hold_open: false,
        }
    }

    /// Consumer replaying `steps`, then waiting forever.
    pub fn open_consumer(&self, steps: Vec<Step>) -> ScriptedConsumer {
        ScriptedConsumer {
            hold_open: true,
            ..self.consumer(steps)
        }
    }

    pub fn consumer_loop(
        &self,
        consumer: ScriptedConsumer,
        router: Arc<dyn TopicRouter>,
        settings: LoopSettings,
    ) -> ConsumerLoop<ScriptedConsumer> {
        ConsumerLoop::new(
            consumer,
            Arc::clone(&self.registry),
            router,
            self.dispatcher(),
            settings,
        )
    }

    pub fn committed(&self) -> Vec<(String, i64)> {
        self.offsets.lock().committed.clone()
    }

    pub fn redelivered(&self) -> Vec<(String, i64)> {
        self.offsets.lock().redelivered.clone()
    }

    pub fn paused(&self) -> Vec<(String, i32)> {
        self.offsets.lock().paused.clone()
    }

    pub fn resumed(&self) -> Vec<(String, i32)> {
        self.offsets.lock().resumed.clone()
    }
}
