//! Wires configuration into a running connector.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectorConfig;
use crate::consumer::{ConsumerLoop, KafkaConsumer, LoopSettings, LoopStats};
use crate::dispatch::Dispatcher;
use crate::error::ConnectorResult;
use crate::invoker::HttpInvoker;
use crate::publisher::{KafkaResponseSink, ResponsePublisher};
use crate::registry::{self, FunctionLister, FunctionRegistry, GatewayClient};
use crate::router::{self, TopicWhitelist};

/// Runs the connector until `cancel` fires or the consumer fails fatally.
///
/// Setup errors (credentials, whitelist, consumer creation) are returned
/// before any message is consumed. A failing initial function listing is
/// logged and retried by the background sync.
pub async fn run(
    config: ConnectorConfig,
    cancel: CancellationToken,
) -> ConnectorResult<LoopStats> {
    let credentials = config.credentials()?;
    let whitelist = TopicWhitelist::new(&config.topics)?;

    info!(
        brokers = %config.brokers(),
        topics = %config.topics,
        gateway_url = %config.gateway_url,
        routing = ?config.routing,
        offset_policy = ?config.offset_policy,
        asynchronous_invocation = config.asynchronous_invocation,
        basic_auth = credentials.is_some(),
        "Starting kafka connector"
    );

    let registry = Arc::new(FunctionRegistry::new());
    let lister: Arc<dyn FunctionLister> = Arc::new(GatewayClient::new(
        config.gateway_url.clone(),
        config.upstream_timeout,
        credentials.clone(),
    )?);

    match registry.refresh(lister.as_ref()).await {
        Ok(snapshot) => info!(functions = snapshot.len(), "Initial function registry loaded"),
        Err(e) => warn!(
            error = %e,
            error_type = e.error_type(),
            "Initial function listing failed, starting with an empty registry"
        ),
    }

    let sync_cancel = cancel.child_token();
    let sync = registry::spawn_sync(
        Arc::clone(&registry),
        lister,
        config.rebuild_interval,
        sync_cancel.clone(),
    );

    let invoker = Arc::new(HttpInvoker::from_config(&config, credentials)?);
    let sink = Arc::new(KafkaResponseSink::new(
        config.brokers(),
        config.producer.clone(),
    ));
    let publisher = Arc::new(ResponsePublisher::new(
        Arc::clone(&registry),
        sink,
        config.writer_annotation.clone(),
    ));
    let dispatcher = Dispatcher::new(invoker, publisher).with_max_in_flight(config.max_in_flight);
    let router = router::from_config(&config);

    let result = match KafkaConsumer::new(&config, &whitelist) {
        Ok(consumer) => {
            ConsumerLoop::new(
                consumer,
                Arc::clone(&registry),
                router,
                dispatcher,
                LoopSettings::from_config(&config),
            )
            .run(cancel)
            .await
        }
        Err(e) => Err(e),
    };

    sync_cancel.cancel();
    if let Err(e) = sync.await {
        warn!(error = %e, "Function registry sync task failed");
    }

    result
}
