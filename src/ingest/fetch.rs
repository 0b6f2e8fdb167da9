// src/ingest/fetch.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{
    HeaderMap, CONTENT_LENGTH, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use std::sync::Arc;
use std::time::Duration;

use crate::ingest::quota::QuotaTracker;
use crate::ingest::types::Validator;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Minimal view of an HTTP response, enough for conditional fetching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn validator(&self) -> Validator {
        Validator {
            last_modified: self.last_modified.clone(),
            etag: self.etag.clone(),
        }
    }
}

/// Network seam. `Err` means the request never produced a response
/// (timeout, DNS, connection reset...).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn head(&self, url: &str) -> Result<HttpResponse>;
    async fn get(&self, url: &str, validator: Option<&Validator>) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn response_meta(resp: &reqwest::Response) -> HttpResponse {
    let headers = resp.headers();
    HttpResponse {
        status: resp.status().as_u16(),
        body: Vec::new(),
        // Read the header itself: HEAD bodies are empty so the body size hint is useless.
        content_length: header_str(headers, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
        last_modified: header_str(headers, LAST_MODIFIED),
        etag: header_str(headers, ETAG),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn head(&self, url: &str) -> Result<HttpResponse> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD {url}"))?;
        Ok(response_meta(&resp))
    }

    async fn get(&self, url: &str, validator: Option<&Validator>) -> Result<HttpResponse> {
        let mut req = self.client.get(url);
        if let Some(v) = validator {
            if let Some(lm) = v.last_modified.as_deref() {
                req = req.header(IF_MODIFIED_SINCE, lm);
            }
            if let Some(tag) = v.etag.as_deref() {
                req = req.header(IF_NONE_MATCH, tag);
            }
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        let mut out = response_meta(&resp);
        out.body = resp
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?
            .to_vec();
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Success { bytes: Vec<u8>, validator: Validator },
    NotModified,
    QuotaExceeded,
    TransportError(String),
}

/// Size-checked, cache-aware retrieval.
///
/// The HEAD probe is advisory: it only avoids a transfer that obviously will
/// not fit. The size of the body actually received is authoritative and is
/// registered with the quota in a single check-and-increment.
#[derive(Clone)]
pub struct ConditionalFetcher {
    transport: Arc<dyn HttpTransport>,
    quota: Arc<QuotaTracker>,
}

impl ConditionalFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, quota: Arc<QuotaTracker>) -> Self {
        Self { transport, quota }
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub async fn fetch(&self, url: &str, cached: Option<&Validator>) -> FetchResult {
        // 1) size probe
        let probe = match self.transport.head(url).await {
            Ok(p) if p.is_success() => p,
            Ok(p) => return transport_error(url, format!("probe status {}", p.status)),
            Err(e) => return transport_error(url, format!("{e:#}")),
        };
        let estimate = probe.content_length.unwrap_or(0);
        if !self.quota.can_consume(estimate) {
            counter!("ingest_quota_rejections_total").increment(1);
            tracing::info!(target: "ingest", url, estimate, "quota would be exceeded, skipping transfer");
            return FetchResult::QuotaExceeded;
        }

        // 2) conditional transfer
        let cached = cached.filter(|v| !v.is_empty());
        let resp = match self.transport.get(url, cached).await {
            Ok(r) => r,
            Err(e) => return transport_error(url, format!("{e:#}")),
        };
        if resp.status == 304 {
            counter!("ingest_not_modified_total").increment(1);
            tracing::debug!(target: "ingest", url, "not modified");
            return FetchResult::NotModified;
        }
        if !resp.is_success() {
            return transport_error(url, format!("status {}", resp.status));
        }

        // 3) + 4) authoritative check and registration
        let actual = resp.body.len() as u64;
        if !self.quota.try_consume(actual) {
            counter!("ingest_quota_rejections_total").increment(1);
            tracing::info!(target: "ingest", url, bytes = actual, "payload exceeds remaining quota, discarded");
            return FetchResult::QuotaExceeded;
        }
        counter!("ingest_fetch_bytes_total").increment(actual);
        tracing::debug!(
            target: "ingest",
            url,
            bytes = actual,
            total = self.quota.used(),
            "downloaded"
        );

        let validator = resp.validator();
        FetchResult::Success {
            bytes: resp.body,
            validator,
        }
    }
}

fn transport_error(url: &str, msg: String) -> FetchResult {
    counter!("ingest_transport_errors_total").increment(1);
    tracing::warn!(target: "ingest", url, error = %msg, "fetch failed");
    FetchResult::TransportError(msg)
}
