//! HTTP invocation of functions through the gateway.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ConnectorConfig, GatewayCredentials};
use crate::consumer::InboundMessage;
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::FunctionDescriptor;

/// Header carrying the source topic to the function.
pub const TOPIC_HEADER: &str = "X-Topic";

/// Result of invoking one function for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    pub function: String,
    pub topic: String,
    pub success: bool,
    pub status: Option<u16>,
    /// Response body, `None` when the function returned nothing.
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl InvocationOutcome {
    pub fn succeeded(
        function: impl Into<String>,
        topic: impl Into<String>,
        status: u16,
        body: Vec<u8>,
    ) -> Self {
        Self {
            function: function.into(),
            topic: topic.into(),
            success: true,
            status: Some(status),
            body: non_empty(body),
            error: None,
        }
    }

    pub fn failed(
        function: impl Into<String>,
        topic: impl Into<String>,
        status: Option<u16>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            function: function.into(),
            topic: topic.into(),
            success: false,
            status,
            body: None,
            error: Some(error.into()),
        }
    }
}

fn non_empty(body: Vec<u8>) -> Option<Vec<u8>> {
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

/// Invokes a function with a message payload.
///
/// Failures are reported in the returned outcome, never as an error.
#[async_trait]
pub trait FunctionInvoker: Send + Sync + std::fmt::Debug {
    async fn invoke(
        &self,
        function: &FunctionDescriptor,
        message: &InboundMessage,
    ) -> InvocationOutcome;
}

/// Which gateway path is used for invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// `/function/{name}`, waits for the function's response.
    Sync,
    /// `/async-function/{name}`, returns once the gateway has queued the call.
    Async,
}

/// Invoker posting payloads to the gateway with `reqwest`.
#[derive(Debug, Clone)]
#[must_use]
pub struct HttpInvoker {
    client: Client,
    mode: InvocationMode,
    credentials: Option<GatewayCredentials>,
    print_response: bool,
    print_response_body: bool,
}

impl HttpInvoker {
    /// Creates an invoker whose requests time out after `timeout`.
    pub fn new(timeout: Duration, mode: InvocationMode) -> ConnectorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            mode,
            credentials: None,
            print_response: false,
            print_response_body: false,
        })
    }

    pub fn from_config(
        config: &ConnectorConfig,
        credentials: Option<GatewayCredentials>,
    ) -> ConnectorResult<Self> {
        let mode = if config.asynchronous_invocation {
            InvocationMode::Async
        } else {
            InvocationMode::Sync
        };
        Ok(Self::new(config.upstream_timeout, mode)?
            .with_credentials(credentials)
            .with_printing(config.print_response, config.print_response_body))
    }

    pub fn with_credentials(mut self, credentials: Option<GatewayCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Log response status and/or body for every invocation.
    pub const fn with_printing(mut self, status: bool, body: bool) -> Self {
        self.print_response = status;
        self.print_response_body = body;
        self
    }

    fn url<'a>(&self, function: &'a FunctionDescriptor) -> &'a str {
        match self.mode {
            InvocationMode::Sync => &function.endpoint,
            InvocationMode::Async => &function.async_endpoint,
        }
    }

    async fn post(
        &self,
        function: &FunctionDescriptor,
        message: &InboundMessage,
    ) -> Result<(u16, Vec<u8>), ConnectorError> {
        let mut request = self
            .client
            .post(self.url(function))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(TOPIC_HEADER, &message.topic)
            .body(message.payload.clone());

        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.user, Some(creds.password.expose_secret()));
        }

        let response = request.send().await.map_err(timeout_or_http)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(timeout_or_http)?;
        Ok((status, body.to_vec()))
    }

    fn print(&self, outcome: &InvocationOutcome) {
        if self.print_response {
            info!(
                function = %outcome.function,
                topic = %outcome.topic,
                status = outcome.status,
                "Function response"
            );
        }
        if self.print_response_body {
            let body = outcome
                .body
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            info!(function = %outcome.function, body = %body, "Function response body");
        }
    }
}

fn timeout_or_http(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout
    } else {
        ConnectorError::Http(e)
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(
        &self,
        function: &FunctionDescriptor,
        message: &InboundMessage,
    ) -> InvocationOutcome {
        let outcome = match self.post(function, message).await {
            Ok((status, body)) if (200..300).contains(&status) => {
                InvocationOutcome::succeeded(&function.name, &message.topic, status, body)
            }
            Ok((status, body)) => {
                let mut outcome = InvocationOutcome::failed(
                    &function.name,
                    &message.topic,
                    Some(status),
                    format!("function returned status {status}"),
                );
                outcome.body = non_empty(body);
                outcome
            }
            Err(e) => {
                warn!(
                    function = %function.name,
                    topic = %message.topic,
                    error = %e,
                    error_type = e.error_type(),
                    "Function invocation failed"
                );
                InvocationOutcome::failed(&function.name, &message.topic, None, e.to_string())
            }
        };

        self.print(&outcome);
        outcome
    }
}
