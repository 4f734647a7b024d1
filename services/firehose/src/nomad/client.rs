//! Nomad HTTP API client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use firehose_events::{parse_allocations, Node};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, error};

use super::{AllocationListing, Orchestrator};

const INDEX_HEADER: &str = "X-Nomad-Index";
const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Orchestrator client over the Nomad HTTP API.
pub struct NomadClient {
    client: reqwest::Client,
    base_url: String,
    namespace: Option<String>,
}

impl NomadClient {
    /// Create a new client.
    pub fn new(base_url: &str, token: Option<&str>, namespace: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                TOKEN_HEADER,
                HeaderValue::from_str(token.trim()).context("Invalid Nomad token format")?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent("allocation-firehose/0.1.0")
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Nomad HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.map(str::to_string),
        })
    }
}

/// The server adds up to wait/16 of jitter to blocking queries.
fn long_poll_timeout(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(10)
}

#[async_trait]
impl Orchestrator for NomadClient {
    async fn list_allocations(
        &self,
        since_index: u64,
        wait: Duration,
    ) -> Result<AllocationListing> {
        let url = format!("{}/v1/allocations", self.base_url);

        let mut query = vec![
            ("index", since_index.to_string()),
            ("wait", format!("{}s", wait.as_secs().max(1))),
            ("stale", "true".to_string()),
        ];
        if let Some(namespace) = &self.namespace {
            query.push(("namespace", namespace.clone()));
        }

        debug!(url = %url, since_index, "Listing allocations");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(long_poll_timeout(wait))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list allocations");
            anyhow::bail!("Failed to list allocations: {} - {}", status, body);
        }

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .with_context(|| format!("Allocation listing without a valid {INDEX_HEADER} header"))?;

        let body = response.bytes().await?;
        let allocations = parse_allocations(&body)?;

        debug!(index, allocation_count = allocations.len(), "Listed allocations");

        Ok(AllocationListing { index, allocations })
    }

    async fn node(&self, node_id: &str) -> Result<Node> {
        let url = format!("{}/v1/node/{}", self.base_url, node_id);
        debug!(url = %url, "Fetching node");

        let response = self.client.get(&url).query(&[("stale", "true")]).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to fetch node {}: {} - {}", node_id, status, body);
        }

        Ok(response.json::<Node>().await?)
    }
}
