//! HTTP client for the gateway's function listing endpoint.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{FunctionDescriptor, FunctionLister};
use crate::config::GatewayCredentials;
use crate::error::{ConnectorError, ConnectorResult};

const LISTING_PATH: &str = "/system/functions";
const BODY_PREVIEW_LEN: usize = 256;

/// A function entry as returned by the gateway listing.
#[derive(Debug, Deserialize)]
struct ListedFunction {
    name: String,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
}

/// Lists deployed functions from the gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
    credentials: Option<GatewayCredentials>,
}

impl GatewayClient {
    /// Creates a client for the gateway at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Option<GatewayCredentials>,
    ) -> ConnectorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credentials,
        })
    }

    fn parse_listing(&self, body: &str) -> ConnectorResult<Vec<FunctionDescriptor>> {
        let listed: Vec<ListedFunction> =
            serde_json::from_str(body).map_err(|e| ConnectorError::Listing {
                reason: e.to_string(),
                preview: body.chars().take(BODY_PREVIEW_LEN).collect(),
            })?;

        Ok(listed
            .into_iter()
            .map(|f| {
                FunctionDescriptor::new(f.name, &self.base_url, f.annotations.unwrap_or_default())
            })
            .collect())
    }
}

#[async_trait]
impl FunctionLister for GatewayClient {
    async fn list_functions(&self) -> ConnectorResult<Vec<FunctionDescriptor>> {
        let url = format!("{}{LISTING_PATH}", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.user, Some(creds.password.expose_secret()));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::GatewayStatus {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        self.parse_listing(&body)
    }
}
