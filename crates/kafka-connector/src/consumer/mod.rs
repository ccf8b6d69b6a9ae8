//! The consume, dispatch and acknowledge loop.
//!
//! One task owns the broker consumer and makes every offset decision. For
//! each event it is `Idle` waiting for the broker, `Dispatching` while routing
//! and invoking, and `Committing` while applying the offset decision. It ends
//! in `Shutdown` on cancellation, end of stream, or a fatal broker error.
//!
//! A partition rewound after a routing failure is paused for the redeliver
//! backoff. The loop keeps serving every other partition in the meantime and
//! resumes the paused one once its deadline passes.

mod kafka;

pub use kafka::KafkaConsumer;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConnectorConfig, OffsetPolicy};
use crate::dispatch::Dispatcher;
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::FunctionRegistry;
use crate::router::TopicRouter;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload,
        }
    }
}

/// Events surfaced by the broker consumer.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Message(InboundMessage),
    /// Transient client error, no message involved.
    Error(String),
    /// Partition assignment or revocation.
    Rebalance(String),
    /// Unrecoverable client error, the loop stops.
    Fatal(String),
}

/// Group-coordinated broker subscription.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Waits for the next event. `None` means the stream has ended.
    async fn next_event(&mut self) -> Option<BrokerEvent>;

    /// Acknowledges `message` so it is not delivered again to the group.
    fn commit(&mut self, message: &InboundMessage) -> ConnectorResult<()>;

    /// Rewinds the message's partition so `message` is read again.
    fn redeliver(&mut self, message: &InboundMessage) -> ConnectorResult<()>;

    /// Stops fetching from one partition until it is resumed.
    fn pause(&mut self, topic: &str, partition: i32) -> ConnectorResult<()>;

    fn resume(&mut self, topic: &str, partition: i32) -> ConnectorResult<()>;
}

/// Loop state, see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Dispatching,
    Committing,
    Shutdown,
}

/// Offset decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetDecision {
    Commit,
    Redeliver,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub committed: u64,
    pub redelivered: u64,
    pub routing_failures: u64,
    pub broker_errors: u64,
    pub rebalances: u64,
    /// Messages dropped because their partition was paused for redelivery.
    pub skipped_paused: u64,
}

/// Tunables of the consumer loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub offset_policy: OffsetPolicy,
    /// How long a rewound partition stays paused. Zero rewinds without pausing.
    pub redeliver_backoff: Duration,
    /// How long shutdown waits for in-flight dispatches.
    pub shutdown_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            offset_policy: OffsetPolicy::default(),
            redeliver_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            offset_policy: config.offset_policy,
            redeliver_backoff: config.redeliver_backoff,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Receives messages, routes them to functions and decides offsets.
#[derive(Debug)]
pub struct ConsumerLoop<C> {
    consumer: C,
    registry: Arc<FunctionRegistry>,
    router: Arc<dyn TopicRouter>,
    dispatcher: Dispatcher,
    settings: LoopSettings,
    tracker: TaskTracker,
    state: LoopState,
    stats: LoopStats,
    sequence: i32,
    /// Paused partitions and when each may be resumed.
    paused: HashMap<(String, i32), Instant>,
}

enum Wakeup {
    Cancelled,
    Resume,
    Event(Option<BrokerEvent>),
}

async fn resume_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<C: BrokerConsumer> ConsumerLoop<C> {
    pub fn new(
        consumer: C,
        registry: Arc<FunctionRegistry>,
        router: Arc<dyn TopicRouter>,
        dispatcher: Dispatcher,
        settings: LoopSettings,
    ) -> Self {
        Self {
            consumer,
            registry,
            router,
            dispatcher,
            settings,
            tracker: TaskTracker::new(),
            state: LoopState::Idle,
            stats: LoopStats::default(),
            sequence: 0,
            paused: HashMap::new(),
        }
    }

    pub const fn state(&self) -> LoopState {
        self.state
    }

    pub const fn stats(&self) -> LoopStats {
        self.stats
    }

    fn transition(&mut self, next: LoopState) {
        trace!(from = ?self.state, to = ?next, "Consumer loop state");
        self.state = next;
    }

    /// Runs until cancelled, the broker stream ends, or a fatal broker error.
    ///
    /// In-flight dispatches are given `shutdown_timeout` to finish before
    /// returning; anything still running after that is abandoned.
    pub async fn run(mut self, cancel: CancellationToken) -> ConnectorResult<LoopStats> {
        info!(
            router = self.router.name(),
            offset_policy = ?self.settings.offset_policy,
            "Consumer loop started"
        );

        let result = loop {
            let next_resume = self.paused.values().min().copied();
            let wakeup = tokio::select! {
                () = cancel.cancelled() => Wakeup::Cancelled,
                () = resume_at(next_resume) => Wakeup::Resume,
                event = self.consumer.next_event() => Wakeup::Event(event),
            };

            let event = match wakeup {
                Wakeup::Cancelled => break Ok(()),
                Wakeup::Resume => {
                    self.resume_due();
                    continue;
                }
                Wakeup::Event(event) => event,
            };

            match event {
                Some(BrokerEvent::Message(message)) => self.process(message).await,
                Some(BrokerEvent::Error(e)) => {
                    self.stats.broker_errors += 1;
                    warn!(error = %e, "Consumer error");
                }
                Some(BrokerEvent::Rebalance(notification)) => {
                    self.stats.rebalances += 1;
                    info!(notification = %notification, "Rebalanced");
                }
                Some(BrokerEvent::Fatal(e)) => {
                    error!(error = %e, "Fatal consumer error");
                    break Err(ConnectorError::ConsumerFatal(e));
                }
                None => {
                    info!("Broker stream ended");
                    break Ok(());
                }
            }
        };

        self.transition(LoopState::Shutdown);
        self.drain().await;
        info!(stats = ?self.stats, "Consumer loop stopped");
        result.map(|()| self.stats)
    }

    /// Routes, dispatches and settles the offset of one message.
    ///
    /// Messages from a paused partition were fetched before the rewind and
    /// are dropped; the partition is read again from the rewound offset.
    pub async fn process(&mut self, message: InboundMessage) {
        if self
            .paused
            .contains_key(&(message.topic.clone(), message.partition))
        {
            self.stats.skipped_paused += 1;
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Dropping message from paused partition"
            );
            return;
        }

        self.stats.received += 1;
        self.sequence = (self.sequence % (i32::MAX - 1)) + 1;
        info!(
            seq = self.sequence,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            bytes = message.payload.len(),
            "Received message"
        );

        self.transition(LoopState::Dispatching);
        let message = Arc::new(message);
        let decision = self.dispatch(&message).await;

        self.transition(LoopState::Committing);
        self.settle(&message, decision);
        self.transition(LoopState::Idle);
    }

    async fn dispatch(&mut self, message: &Arc<InboundMessage>) -> OffsetDecision {
        // Always the latest snapshot, not one taken when the message arrived.
        let snapshot = self.registry.snapshot();
        let functions = self.router.route(&message.topic, &snapshot);

        if functions.is_empty() {
            self.stats.routing_failures += 1;
            let decision = match self.settings.offset_policy {
                OffsetPolicy::FireAndForget => OffsetDecision::Commit,
                OffsetPolicy::RetryOnRedeliver => OffsetDecision::Redeliver,
            };
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                registry_version = snapshot.version(),
                known_functions = snapshot.len(),
                decision = ?decision,
                "No function matches topic"
            );
            return decision;
        }

        debug!(
            topic = %message.topic,
            functions = ?functions.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Dispatching message"
        );

        match self.settings.offset_policy {
            OffsetPolicy::FireAndForget => {
                self.dispatcher
                    .spawn_all(&self.tracker, functions, message)
                    .await;
            }
            OffsetPolicy::RetryOnRedeliver => {
                let reports = self.dispatcher.run_all(functions, message).await;
                let failed = reports.iter().filter(|r| !r.outcome.success).count();
                debug!(attempted = reports.len(), failed, "Dispatch completed");
            }
        }
        OffsetDecision::Commit
    }

    fn settle(&mut self, message: &InboundMessage, decision: OffsetDecision) {
        match decision {
            OffsetDecision::Commit => match self.consumer.commit(message) {
                Ok(()) => self.stats.committed += 1,
                Err(e) => warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Offset commit failed"
                ),
            },
            OffsetDecision::Redeliver => {
                if !self.settings.redeliver_backoff.is_zero() {
                    self.pause_partition(message);
                }
                match self.consumer.redeliver(message) {
                    Ok(()) => self.stats.redelivered += 1,
                    Err(e) => warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Redelivery request failed"
                    ),
                }
            }
        }
    }

    fn pause_partition(&mut self, message: &InboundMessage) {
        match self.consumer.pause(&message.topic, message.partition) {
            Ok(()) => {
                let resume_at = Instant::now() + self.settings.redeliver_backoff;
                self.paused
                    .insert((message.topic.clone(), message.partition), resume_at);
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    backoff = ?self.settings.redeliver_backoff,
                    "Partition paused for redelivery"
                );
            }
            Err(e) => warn!(
                topic = %message.topic,
                partition = message.partition,
                error = %e,
                "Partition pause failed"
            ),
        }
    }

    fn resume_due(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, i32)> = self
            .paused
            .iter()
            .filter(|(_, resume_at)| **resume_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            self.paused.remove(&key);
            let (topic, partition) = key;
            match self.consumer.resume(&topic, partition) {
                Ok(()) => debug!(topic = %topic, partition, "Partition resumed"),
                Err(e) => warn!(
                    topic = %topic,
                    partition,
                    error = %e,
                    "Partition resume failed"
                ),
            }
        }
    }

    /// Waits for in-flight dispatches, up to the shutdown timeout.
    pub async fn drain(&self) {
        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }
        info!(in_flight = self.tracker.len(), "Waiting for in-flight dispatches");
        if tokio::time::timeout(self.settings.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                "Abandoning in-flight dispatches"
            );
        }
    }
}
