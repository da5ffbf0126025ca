// Marketplace HTTP client

use crate::config::MarketplaceConfig;
use crate::error::{FetchError, PipelineError};
use crate::fetcher::{PageSource, SourcePage};
use crate::models::RawExtension;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// API version the gallery query endpoint expects in the Accept header
const GALLERY_ACCEPT: &str = "application/json;api-version=3.0-preview.1";

/// [`PageSource`] backed by the marketplace `extensionquery` endpoint
pub struct MarketplaceClient {
    client: Client,
    url: String,
    flags: u32,
}

impl MarketplaceClient {
    /// Create new client with configuration
    pub fn new(config: &MarketplaceConfig) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            flags: config.flags,
        })
    }

    fn query_body(&self, page: u32, page_size: u32) -> Value {
        json!({
            "filters": [{
                "criteria": [
                    { "filterType": 8, "value": "Microsoft.VisualStudio.Code" },
                    { "filterType": 10, "value": "target:\"Microsoft.VisualStudio.Code\" " },
                ],
                "direction": 2,
                "pageSize": page_size,
                "pageNumber": page,
                "sortBy": 4,
                "sortOrder": 0,
            }],
            "flags": self.flags,
        })
    }
}

#[async_trait]
impl PageSource for MarketplaceClient {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<SourcePage, FetchError> {
        let response = self
            .client
            .post(&self.url)
            .header(ACCEPT, GALLERY_ACCEPT)
            .json(&self.query_body(page, page_size))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient {
                reason: format!("HTTP {} (rate limited)", status),
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(FetchError::transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::permanent(format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::transient(format!("failed to read response body: {}", e)))?;
        debug!(page, bytes = bytes.len(), "Received page body");

        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::permanent(format!("response is not valid JSON: {}", e)))?;

        parse_query_response(&body)
    }
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::permanent(format!("invalid request: {}", err))
    } else if err.is_timeout() {
        FetchError::transient(format!("request timed out: {}", err))
    } else {
        FetchError::transient(format!("request failed: {}", err))
    }
}

/// `Retry-After` in its delta-seconds form; HTTP-date values are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Extract extensions and the continuation indicator from a query response
///
/// An empty `results` array is the end sentinel. A result without an
/// `extensions` array is a schema violation.
pub fn parse_query_response(body: &Value) -> Result<SourcePage, FetchError> {
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::permanent("response has no `results` array"))?;

    let Some(result) = results.first() else {
        return Ok(SourcePage::default());
    };

    let extensions = result
        .get("extensions")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::permanent("result has no `extensions` array"))?;

    Ok(SourcePage {
        extensions: extensions.iter().cloned().map(RawExtension::new).collect(),
        total_count: total_count(result),
    })
}

fn total_count(result: &Value) -> Option<u64> {
    result
        .get("resultMetadata")?
        .as_array()?
        .iter()
        .find(|meta| meta.get("metadataType").and_then(Value::as_str) == Some("ResultCount"))?
        .get("metadataItems")?
        .as_array()?
        .iter()
        .find(|item| item.get("name").and_then(Value::as_str) == Some("TotalCount"))?
        .get("count")?
        .as_u64()
}
