use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, HeaderValue, RANGE, USER_AGENT,
};
use thiserror::Error;

use crate::config::{CatalogSettings, OriginCredentials};
use crate::error::SyncError;

static S3ETAG_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^x-s3etag-(\d+)$").unwrap());

/// What a HEAD-style probe learns about a remote file without fetching it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub size: Option<u64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub etag: Option<String>,
    pub s3etags: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("not found")]
    NotFound,
    #[error("authentication failed")]
    AuthFailed,
    #[error("transport error: {0}")]
    Transport(String),
}

pub trait ArchiveProbe: Send + Sync {
    /// Probe the catalog's own file server; its hash headers are exact.
    fn probe_catalog(&self, url: &str) -> Result<ProbeResult, ProbeError>;
    /// Probe the origin download server; only size and an opaque ETag.
    fn probe_origin(&self, url: &str) -> Result<ProbeResult, ProbeError>;
}

#[derive(Clone)]
pub struct HttpArchiveProbe {
    catalog: Client,
    origin: Client,
    origin_credentials: Option<OriginCredentials>,
}

impl HttpArchiveProbe {
    pub fn new(
        catalog: &CatalogSettings,
        origin_credentials: Option<OriginCredentials>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let user_agent =
            HeaderValue::from_str(&format!("bioarchive-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;

        let mut catalog_headers = HeaderMap::new();
        catalog_headers.insert(USER_AGENT, user_agent.clone());
        if let Some(api_key) = catalog.api_key.as_deref() {
            let mut value = HeaderValue::from_str(api_key)
                .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
            value.set_sensitive(true);
            catalog_headers.insert(AUTHORIZATION, value);
        }
        let catalog_client = Client::builder()
            .default_headers(catalog_headers)
            .timeout(timeout)
            .danger_accept_invalid_certs(!catalog.verify_tls)
            .build()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;

        let mut origin_headers = HeaderMap::new();
        origin_headers.insert(USER_AGENT, user_agent);
        let origin_client = Client::builder()
            .default_headers(origin_headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;

        Ok(Self {
            catalog: catalog_client,
            origin: origin_client,
            origin_credentials,
        })
    }

    fn origin_request(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.origin_credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, credentials.password.as_ref())
            }
            None => request,
        }
    }
}

impl ArchiveProbe for HttpArchiveProbe {
    fn probe_catalog(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let response = self
            .catalog
            .head(url)
            .send()
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        let response = check_status(response)?;
        Ok(parse_headers(response.headers()))
    }

    fn probe_origin(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let response = self
            .origin_request(self.origin.head(url))
            .send()
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            // Some origin servers refuse HEAD; a one-byte range is the next
            // cheapest way to learn the size.
            let response = self
                .origin_request(self.origin.get(url).header(RANGE, "bytes=0-0"))
                .send()
                .map_err(|err| ProbeError::Transport(err.to_string()))?;
            let response = check_status(response)?;
            let mut result = parse_headers(response.headers());
            if response.status() == StatusCode::PARTIAL_CONTENT {
                result.size = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(content_range_total);
            }
            return Ok(result);
        }
        let response = check_status(response)?;
        Ok(parse_headers(response.headers()))
    }
}

fn check_status(response: Response) -> Result<Response, ProbeError> {
    match response.status() {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(ProbeError::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProbeError::AuthFailed),
        status if status.is_success() => Ok(response),
        status => Err(ProbeError::Transport(format!("unexpected status {status}"))),
    }
}

/// Read size and hash headers; ETags are unquoted and weak markers dropped.
pub fn parse_headers(headers: &HeaderMap) -> ProbeResult {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let mut result = ProbeResult {
        size: headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok()),
        md5: text("x-md5").map(|value| value.to_lowercase()),
        sha256: text("x-sha256").map(|value| value.to_lowercase()),
        etag: headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(unquote_etag),
        s3etags: BTreeMap::new(),
    };
    for (name, value) in headers {
        let Some(captures) = S3ETAG_HEADER.captures(name.as_str()) else {
            continue;
        };
        let (Ok(size), Ok(value)) = (captures[1].parse::<u64>(), value.to_str()) else {
            continue;
        };
        result.s3etags.insert(size, unquote_etag(value));
    }
    result
}

fn unquote_etag(value: &str) -> String {
    value
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}
