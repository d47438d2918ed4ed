use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::Attrs;
use crate::error::SyncError;
use crate::probe::{ArchiveProbe, ProbeError, ProbeResult};

static S3ETAG_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^s3etag_(\d+)$").unwrap());

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuploadReason {
    NotHosted,
    MissingFromArchive,
    ArchiveUnreachable,
    OriginMissing,
    OriginUnreachable,
    SizeMismatch,
    HashMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Ok,
    NeedsReupload(ReuploadReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub resource_id: String,
    pub verdict: Verdict,
}

/// One extant resource as the catalog reports it, paired with the origin
/// URL its bytes should come from.
#[derive(Debug, Clone, Copy)]
pub struct VerifyItem<'a> {
    pub remote: &'a Attrs,
    pub origin_url: &'a str,
}

/// Classifies extant resources as intact or needing re-upload. Read-only:
/// the only I/O is HEAD-style probes, run over a bounded pool.
pub struct ResourceVerifier<'a> {
    probe: &'a dyn ArchiveProbe,
    catalog_base_url: String,
    pool_size: usize,
    retry_delay: Duration,
}

impl<'a> ResourceVerifier<'a> {
    pub fn new(probe: &'a dyn ArchiveProbe, catalog_base_url: &str, pool_size: usize) -> Self {
        Self {
            probe,
            catalog_base_url: catalog_base_url.trim_end_matches('/').to_string(),
            pool_size: pool_size.max(1),
            retry_delay: Duration::from_millis(PROBE_RETRY_DELAY_MS),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn verify(&self, items: &[VerifyItem<'_>]) -> Result<Vec<Verification>, SyncError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.pool_size)
            .thread_name(|idx| format!("verify-{idx}"))
            .build()
            .map_err(|err| SyncError::Filesystem(format!("verifier pool: {err}")))?;
        let results: Vec<Result<Verification, SyncError>> =
            pool.install(|| items.par_iter().map(|item| self.verify_one(item)).collect());
        results.into_iter().collect()
    }

    pub fn verify_one(&self, item: &VerifyItem<'_>) -> Result<Verification, SyncError> {
        let resource_id = item
            .remote
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let verdict = self.classify(item)?;
        if let Verdict::NeedsReupload(reason) = verdict {
            debug!(resource_id = %resource_id, ?reason, "resource needs re-upload");
        }
        Ok(Verification {
            resource_id,
            verdict,
        })
    }

    fn classify(&self, item: &VerifyItem<'_>) -> Result<Verdict, SyncError> {
        let hosted_url = item.remote.get("url").and_then(Value::as_str).unwrap_or("");
        if !self.is_catalog_hosted(hosted_url) {
            return Ok(Verdict::NeedsReupload(ReuploadReason::NotHosted));
        }

        let hosted_probe = self.probe_with_retry(hosted_url, |url| self.probe.probe_catalog(url))?;
        let hosted = match hosted_probe {
            Ok(result) => result,
            Err(ProbeError::NotFound) => {
                return Ok(Verdict::NeedsReupload(ReuploadReason::MissingFromArchive));
            }
            Err(_) => return Ok(Verdict::NeedsReupload(ReuploadReason::ArchiveUnreachable)),
        };

        let origin_probe =
            self.probe_with_retry(item.origin_url, |url| self.probe.probe_origin(url))?;
        let origin = match origin_probe {
            Ok(result) => result,
            Err(ProbeError::NotFound) => {
                warn!(origin_url = item.origin_url, "origin file not found");
                return Ok(Verdict::NeedsReupload(ReuploadReason::OriginMissing));
            }
            Err(_) => return Ok(Verdict::NeedsReupload(ReuploadReason::OriginUnreachable)),
        };

        let expected_size = origin.size.or_else(|| attr_u64(item.remote, "size"));
        if let (Some(hosted_size), Some(expected)) = (hosted.size, expected_size) {
            if hosted_size != expected {
                return Ok(Verdict::NeedsReupload(ReuploadReason::SizeMismatch));
            }
        }

        if hashes_match(item.remote, &hosted) {
            return Ok(Verdict::Ok);
        }

        match (&hosted.etag, &origin.etag) {
            (Some(hosted_etag), Some(origin_etag)) if hosted_etag == origin_etag => Ok(Verdict::Ok),
            _ => Ok(Verdict::NeedsReupload(ReuploadReason::HashMismatch)),
        }
    }

    fn is_catalog_hosted(&self, url: &str) -> bool {
        url.starts_with(&self.catalog_base_url)
            && url[self.catalog_base_url.len()..].starts_with('/')
    }

    /// Transport failures are retried; a persistent auth failure is the one
    /// outcome that escapes as a hard error.
    fn probe_with_retry<F>(
        &self,
        url: &str,
        probe: F,
    ) -> Result<Result<ProbeResult, ProbeError>, SyncError>
    where
        F: Fn(&str) -> Result<ProbeResult, ProbeError>,
    {
        let mut attempt = 1;
        loop {
            match probe(url) {
                Err(ProbeError::Transport(message)) if attempt < PROBE_ATTEMPTS => {
                    warn!(url, attempt, error = %message, "probe failed, retrying");
                    thread::sleep(self.retry_delay * attempt);
                    attempt += 1;
                }
                Err(ProbeError::AuthFailed) if attempt < PROBE_ATTEMPTS => {
                    thread::sleep(self.retry_delay * attempt);
                    attempt += 1;
                }
                Err(ProbeError::AuthFailed) => {
                    return Err(SyncError::ProbeAuth {
                        url: url.to_string(),
                    });
                }
                other => return Ok(other),
            }
        }
    }
}

/// Catalog hash headers are exact: any agreeing md5, sha256 or multipart
/// ETag accepts the hosted copy.
fn hashes_match(remote: &Attrs, hosted: &ProbeResult) -> bool {
    let attr = |key: &str| remote.get(key).and_then(Value::as_str);
    if let (Some(expected), Some(actual)) = (attr("sha256"), hosted.sha256.as_deref()) {
        if expected.eq_ignore_ascii_case(actual) {
            return true;
        }
    }
    if let (Some(expected), Some(actual)) = (attr("md5"), hosted.md5.as_deref()) {
        if expected.eq_ignore_ascii_case(actual) {
            return true;
        }
    }
    remote.iter().any(|(key, value)| {
        let Some(captures) = S3ETAG_ATTR.captures(key) else {
            return false;
        };
        let (Ok(chunk_size), Some(expected)) = (captures[1].parse::<u64>(), value.as_str()) else {
            return false;
        };
        hosted.s3etags.get(&chunk_size).map(String::as_str) == Some(expected)
    })
}

fn attr_u64(attrs: &Attrs, key: &str) -> Option<u64> {
    match attrs.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
