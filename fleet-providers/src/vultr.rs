use crate::{ApiError, CloudProvider, Params};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.vultr.com/v2";

const PAGE_SIZE: &str = "500";
const MAX_PAGES: usize = 100;

pub struct VultrProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl VultrProvider {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a poll can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build Vultr HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url).bearer_auth(&self.api_key)
    }

    async fn send(&self, what: &str, req: RequestBuilder) -> Result<Value> {
        let resp = req.send().await.map_err(ApiError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ApiError::from)?;

        if !status.is_success() {
            tracing::warn!(
                "❌ [Vultr API] {} failed: status={}, response={}",
                what,
                status.as_u16(),
                text
            );
            return Err(ApiError::status(status.as_u16(), text).into());
        }

        tracing::debug!("✅ [Vultr API] {} succeeded: status={}", what, status.as_u16());
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let body = serde_json::from_str(&text)
            .map_err(|e| ApiError::MalformedResponse(format!("{}: {}", what, e)))?;
        Ok(body)
    }

    /// Follows `meta.links.next` until the cursor is empty and returns every
    /// item under `key` as one listing.
    async fn list_all(&self, path: &str, key: &str) -> Result<Value> {
        let what = format!("GET {}", path);
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut req = self
                .request(Method::GET, path)
                .query(&[("per_page", PAGE_SIZE)]);
            if let Some(c) = &cursor {
                req = req.query(&[("cursor", c.as_str())]);
            }
            let page = self.send(&what, req).await?;
            match take_page(page, key, &mut items)? {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => {
                    let mut listing = serde_json::Map::new();
                    listing.insert(key.to_string(), Value::Array(items));
                    return Ok(Value::Object(listing));
                }
            }
        }
        Err(ApiError::MalformedResponse(format!(
            "{}: more than {} pages",
            what, MAX_PAGES
        ))
        .into())
    }
}

/// Moves the items of one page into `items`; returns the next cursor, if any.
fn take_page(mut page: Value, key: &str, items: &mut Vec<Value>) -> Result<Option<String>, ApiError> {
    match page.get_mut(key).map(Value::take) {
        Some(Value::Array(batch)) => items.extend(batch),
        _ => {
            return Err(ApiError::MalformedResponse(format!(
                "listing has no '{}' array",
                key
            )))
        }
    }
    Ok(page
        .pointer("/meta/links/next")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string))
}

#[async_trait]
impl CloudProvider for VultrProvider {
    fn name(&self) -> &'static str {
        "vultr"
    }

    async fn create_instance(&self, params: &Params) -> Result<Value> {
        tracing::info!(
            "🔵 [Vultr API] POST /instances - Creating instance: keys={:?}",
            params.keys().collect::<Vec<_>>()
        );
        let req = self
            .request(Method::POST, "/instances")
            .json(&params.to_json());
        self.send("POST /instances", req).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Value> {
        let path = format!("/instances/{}", instance_id);
        self.send(&format!("GET {}", path), self.request(Method::GET, &path))
            .await
    }

    async fn list_instances(&self) -> Result<Value> {
        self.list_all("/instances", "instances").await
    }

    async fn start_instance(&self, instance_id: &str) -> Result<Value> {
        let path = format!("/instances/{}/start", instance_id);
        tracing::info!("🔵 [Vultr API] POST {} - Starting server", path);
        self.send(&format!("POST {}", path), self.request(Method::POST, &path))
            .await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<Value> {
        let path = format!("/instances/{}/halt", instance_id);
        tracing::info!("🔵 [Vultr API] POST {} - Halting server", path);
        self.send(&format!("POST {}", path), self.request(Method::POST, &path))
            .await
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<Value> {
        let path = format!("/instances/{}", instance_id);
        tracing::info!("🔵 [Vultr API] DELETE {} - Destroying server", path);
        self.send(&format!("DELETE {}", path), self.request(Method::DELETE, &path))
            .await
    }

    async fn create_snapshot(&self, params: &Params) -> Result<Value> {
        tracing::info!(
            "🔵 [Vultr API] POST /snapshots - Creating snapshot: keys={:?}",
            params.keys().collect::<Vec<_>>()
        );
        let req = self
            .request(Method::POST, "/snapshots")
            .json(&params.to_json());
        self.send("POST /snapshots", req).await
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Value> {
        let path = format!("/snapshots/{}", snapshot_id);
        self.send(&format!("GET {}", path), self.request(Method::GET, &path))
            .await
    }

    async fn list_snapshots(&self) -> Result<Value> {
        self.list_all("/snapshots", "snapshots").await
    }
}
