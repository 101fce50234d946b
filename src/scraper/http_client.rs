use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Max characters of an error body kept for diagnosis.
const SNIPPET_LEN: usize = 400;

/// Response headers worth logging when a request is rejected.
const DIAGNOSTIC_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "pragma",
    "expires",
    "x-frame-options",
    "x-content-type-options",
    "strict-transport-security",
    "vary",
    "date",
    "server",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}")]
    Status {
        status: StatusCode,
        snippet: Option<String>,
        headers: BTreeMap<String, String>,
    },
    #[error("failed to decode JSON body: {0}")]
    Decode(#[source] reqwest::Error),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(status.as_u16()),
            FetchError::Request(e) | FetchError::Decode(e) => e.status().map(|s| s.as_u16()),
            FetchError::Url { .. } => None,
        }
    }

    pub fn snippet(&self) -> Option<&str> {
        match self {
            FetchError::Status { snippet, .. } => snippet.as_deref(),
            _ => None,
        }
    }

    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            FetchError::Status { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

/// Browser-like HTTP session shared by every request of a run.
///
/// Holds the cookie jar and the fixed header set; the upstream blocks
/// clients whose headers or cookies change between requests.
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(browser_headers(config)?)
            .timeout(config.timeout())
            .gzip(true)
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { inner })
    }

    /// Issue one request. Non-2xx statuses become [`FetchError::Status`].
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Response, FetchError> {
        let mut url = Url::parse(url).map_err(|source| FetchError::Url {
            url: url.to_string(),
            source,
        })?;
        if !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        }

        let start = Instant::now();
        let resp = self.inner.request(method.clone(), url.clone()).send().await?;
        let status = resp.status();
        debug!(%method, %url, status = status.as_u16(), elapsed = ?start.elapsed(), "HTTP");

        if status.is_success() {
            return Ok(resp);
        }

        let headers = pick_headers(resp.headers());
        let snippet = resp
            .text()
            .await
            .ok()
            .filter(|t| !t.is_empty())
            .map(|t| t.chars().take(SNIPPET_LEN).collect());
        Err(FetchError::Status { status, snippet, headers })
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        self.request(Method::GET, url, params)
            .await?
            .json()
            .await
            .map_err(FetchError::Decode)
    }
}

fn browser_headers(config: &ScraperConfig) -> Result<HeaderMap> {
    let mut h = HeaderMap::new();
    let fixed: [(HeaderName, &str); 10] = [
        (header::ACCEPT, "application/hal+json, application/json;q=0.9, */*;q=0.8"),
        (header::ACCEPT_LANGUAGE, config.accept_language.as_str()),
        (header::ORIGIN, config.origin.as_str()),
        (header::REFERER, config.referer.as_str()),
        (HeaderName::from_static("x-requested-with"), "XMLHttpRequest"),
        (header::CACHE_CONTROL, "no-cache"),
        (header::PRAGMA, "no-cache"),
        (HeaderName::from_static("sec-fetch-site"), "same-origin"),
        (HeaderName::from_static("sec-fetch-mode"), "cors"),
        (HeaderName::from_static("sec-fetch-dest"), "empty"),
    ];
    for (name, value) in fixed {
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {}", name))?;
        h.insert(name, value);
    }
    Ok(h)
}

fn pick_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = DIAGNOSTIC_HEADERS
        .iter()
        .filter_map(|k| {
            headers
                .get(*k)
                .and_then(|v| v.to_str().ok())
                .map(|v| (k.to_string(), v.to_string()))
        })
        .collect();
    let cookies = headers.get_all(header::SET_COOKIE).iter().count();
    if cookies > 0 {
        out.insert("set-cookie-count".to_string(), cookies.to_string());
    }
    out
}
