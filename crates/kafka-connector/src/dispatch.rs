//! Fan-out of one message to its matched functions.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::consumer::InboundMessage;
use crate::invoker::{FunctionInvoker, InvocationOutcome};
use crate::publisher::{PublishResult, ResponsePublisher};
use crate::registry::FunctionDescriptor;

/// Default bound on detached dispatches.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Invokes a function and hands its outcome to the response publisher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn FunctionInvoker>,
    publisher: Arc<ResponsePublisher>,
    in_flight: Arc<Semaphore>,
}

/// Completed work for one function.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: InvocationOutcome,
    pub publish: PublishResult,
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn FunctionInvoker>, publisher: Arc<ResponsePublisher>) -> Self {
        Self {
            invoker,
            publisher,
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
        }
    }

    /// Limits how many detached dispatches run at once. Zero is treated as one.
    #[must_use]
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Invokes `function` with `message` and republishes the response.
    pub async fn dispatch(
        &self,
        function: &FunctionDescriptor,
        message: &InboundMessage,
    ) -> DispatchReport {
        let outcome = self.invoker.invoke(function, message).await;

        if !outcome.success {
            warn!(
                function = %outcome.function,
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                status = outcome.status,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Invocation failed"
            );
        }

        let publish = self.publisher.handle(&outcome).await;
        DispatchReport { outcome, publish }
    }

    /// Starts one task per function on `tracker` without waiting for them.
    ///
    /// Each task holds an in-flight slot until it finishes. When every slot
    /// is taken this waits for one to free up before spawning.
    pub async fn spawn_all(
        &self,
        tracker: &TaskTracker,
        functions: Vec<Arc<FunctionDescriptor>>,
        message: &Arc<InboundMessage>,
    ) {
        for function in functions {
            if self.in_flight.available_permits() == 0 {
                debug!(
                    function = %function.name,
                    topic = %message.topic,
                    "Dispatch limit reached, waiting for a slot"
                );
            }
            let Ok(permit) = Arc::clone(&self.in_flight).acquire_owned().await else {
                error!(function = %function.name, "Dispatch limiter closed");
                return;
            };

            let dispatcher = self.clone();
            let message = Arc::clone(message);
            tracker.spawn(async move {
                dispatcher.dispatch(&function, &message).await;
                drop(permit);
            });
        }
    }

    /// Runs one task per function and waits for all of them.
    ///
    /// Reports are returned in completion order. A panicking task is logged
    /// and left out.
    pub async fn run_all(
        &self,
        functions: Vec<Arc<FunctionDescriptor>>,
        message: &Arc<InboundMessage>,
    ) -> Vec<DispatchReport> {
        let mut tasks = JoinSet::new();
        for function in functions {
            let dispatcher = self.clone();
            let message = Arc::clone(message);
            tasks.spawn(async move { dispatcher.dispatch(&function, &message).await });
        }

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Dispatch task failed"),
            }
        }
        reports
    }
}
