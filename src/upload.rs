use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tempfile::Builder;
use tracing::{error, info};

use crate::catalog::{CatalogApi, CatalogKind, Lookup, patch_if_required};
use crate::config::OriginCredentials;
use crate::domain::{Attrs, Resource};
use crate::error::SyncError;
use crate::multihash::{MultiHash, Multihasher};
use crate::sync::CancelToken;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Streams raw bytes from the origin download server.
pub trait OriginSource: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError>;
}

#[derive(Clone)]
pub struct HttpOriginSource {
    client: Client,
    credentials: Option<OriginCredentials>,
}

impl HttpOriginSource {
    pub fn new(credentials: Option<OriginCredentials>, idle: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bioarchive-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(None)
            .connect_timeout(idle)
            .pool_idle_timeout(idle)
            .build()
            .map_err(|err| SyncError::OriginHttp {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            credentials,
        })
    }
}

impl OriginSource for HttpOriginSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let mut request = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, credentials.password.as_ref());
        }
        let response = request.send().map_err(|err| SyncError::OriginHttp {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(SyncError::OriginStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(Box::new(response))
    }
}

/// What one successful upload changed in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uploaded {
    pub placeholder_patched: bool,
}

impl Uploaded {
    /// Mutating RPCs issued: the upload itself plus any placeholder patch.
    pub fn mutations(&self) -> usize {
        1 + usize::from(self.placeholder_patched)
    }
}

/// Moves bytes origin -> local tempfile -> catalog upload endpoint.
pub struct Uploader<'a> {
    catalog: &'a dyn CatalogApi,
    origin: &'a dyn OriginSource,
    staging_dir: PathBuf,
}

impl<'a> Uploader<'a> {
    pub fn new(
        catalog: &'a dyn CatalogApi,
        origin: &'a dyn OriginSource,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            origin,
            staging_dir: staging_dir.into(),
        }
    }

    /// Upload each resource over a bounded pool. Results keep input order.
    pub fn upload_all(
        &self,
        resources: &[&Resource],
        pool_size: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<(String, Result<Uploaded, SyncError>)>, SyncError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(pool_size.max(1))
            .thread_name(|idx| format!("upload-{idx}"))
            .build()
            .map_err(|err| SyncError::Filesystem(format!("upload pool: {err}")))?;
        Ok(pool.install(|| {
            resources
                .par_iter()
                .map(|resource| {
                    let outcome = if cancel.is_cancelled() {
                        Err(SyncError::Cancelled)
                    } else {
                        self.upload(resource)
                    };
                    (resource.id().to_string(), outcome)
                })
                .collect()
        }))
    }

    pub fn upload(&self, resource: &Resource) -> Result<Uploaded, SyncError> {
        fs::create_dir_all(&self.staging_dir)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        // Removed on drop, whichever way this function exits.
        let mut staged = Builder::new()
            .prefix("bioarchive-upload-")
            .tempfile_in(&self.staging_dir)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;

        let reader = self.origin.open(&resource.origin_url).inspect_err(|err| {
            error!(
                resource_id = resource.id(),
                filename = resource.filename(),
                ticket = resource.ticket(),
                error = %err,
                "origin download failed; resource will be retried next sync"
            );
        })?;
        let digest = stage(reader, staged.as_file_mut())?;
        let expected_sha256 = resource.attrs.get("sha256").and_then(Value::as_str);
        let sha256_ok = expected_sha256
            .map(|expected| expected.eq_ignore_ascii_case(&digest.sha256))
            .unwrap_or(true);
        if !digest.md5.eq_ignore_ascii_case(resource.id()) || !sha256_ok {
            let md5 = digest.md5;
            error!(
                critical = true,
                resource_id = resource.id(),
                filename = resource.filename(),
                ticket = resource.ticket(),
                actual = %md5,
                "downloaded bytes do not hash to the resource checksums, possible corruption"
            );
            return Err(SyncError::ChecksumMismatch {
                filename: resource.filename().to_string(),
                ticket: resource.ticket().to_string(),
                expected: resource.id().to_string(),
                actual: md5,
            });
        }

        let placeholder_patched = self.set_placeholder(resource)?;

        let mut attrs: Attrs = resource.attrs.clone();
        attrs.remove("url");
        self.catalog.upload_resource(&attrs, staged.path())?;
        info!(
            resource_id = resource.id(),
            filename = resource.filename(),
            "resource uploaded"
        );
        Ok(Uploaded {
            placeholder_patched,
        })
    }

    /// Older catalog servers reject an upload onto a resource without a
    /// url; the origin URL doubles as that placeholder until the upload
    /// lands.
    fn set_placeholder(&self, resource: &Resource) -> Result<bool, SyncError> {
        let remote = match self.catalog.show(CatalogKind::Resource, resource.id())? {
            Lookup::Found(record) => record,
            _ => Attrs::new(),
        };
        let mut desired = Attrs::new();
        desired.insert("id".to_string(), Value::String(resource.id().to_string()));
        desired.insert("url".to_string(), Value::String(resource.origin_url.clone()));
        let (patched, _) =
            patch_if_required(self.catalog, CatalogKind::Resource, &remote, &desired, &[])?;
        Ok(patched)
    }
}

/// Copy `reader` into `file` through a 1 MiB buffer, hashing the bytes
/// written.
fn stage(mut reader: impl Read, file: &mut fs::File) -> Result<MultiHash, SyncError> {
    let mut hasher = Multihasher::new(&[])?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SyncError::Filesystem(err.to_string())),
        };
        hasher.update(&buffer[..read]);
        writer
            .write_all(&buffer[..read])
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(hasher.finish())
}
