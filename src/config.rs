use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::sync::SyncOptions;

pub const DEFAULT_CONFIG_FILE: &str = "bioarchive-sync.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub catalog_base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
    #[serde(default)]
    pub do_verify: Option<bool>,
    #[serde(default)]
    pub do_upload: Option<bool>,
    #[serde(default)]
    pub do_delete: Option<bool>,
    #[serde(default)]
    pub worker_pool_size: Option<usize>,
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
    #[serde(default)]
    pub upload_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub search_rows: Option<usize>,
    #[serde(default)]
    pub origin_credentials: Option<OriginCredentials>,
    #[serde(default)]
    pub staging_dir: Option<String>,
}

/// Passed through untouched to the origin HTTP client as basic auth.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OriginCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub verify_tls: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub catalog: CatalogSettings,
    pub origin_credentials: Option<OriginCredentials>,
    pub options: SyncOptions,
    pub probe_timeout: Duration,
    pub upload_idle_timeout: Duration,
    pub staging_dir: Utf8PathBuf,
}

/// Values read from the process environment; they win over the file when
/// non-empty.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub api_key: Option<String>,
    pub origin_username: Option<String>,
    pub origin_password: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_env("CATALOG_API_KEY"),
            origin_username: non_empty_env("ORIGIN_USERNAME"),
            origin_password: non_empty_env("ORIGIN_PASSWORD"),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, EnvOverrides::from_env())
    }

    pub fn resolve_config(
        config: Config,
        env: EnvOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let base_url = config.catalog_base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SyncError::InvalidConfig(format!(
                "catalog_base_url must be an http(s) URL, got {base_url:?}"
            )));
        }

        let defaults = SyncOptions::default();
        let worker_pool_size = config.worker_pool_size.unwrap_or(defaults.worker_pool_size);
        if worker_pool_size == 0 {
            return Err(SyncError::InvalidConfig(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        let options = SyncOptions {
            do_verify: config.do_verify.unwrap_or(defaults.do_verify),
            do_upload: config.do_upload.unwrap_or(defaults.do_upload),
            do_delete: config.do_delete.unwrap_or(defaults.do_delete),
            worker_pool_size,
            search_rows: config.search_rows.unwrap_or(defaults.search_rows),
        };

        let mut origin_credentials = config.origin_credentials;
        if let Some(username) = env.origin_username {
            origin_credentials = Some(OriginCredentials {
                username,
                password: env.origin_password,
            });
        } else if let (Some(credentials), Some(password)) =
            (origin_credentials.as_mut(), env.origin_password)
        {
            credentials.password = Some(password);
        }

        let staging_dir = match config.staging_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_staging_dir()?,
        };

        Ok(ResolvedConfig {
            catalog: CatalogSettings {
                base_url,
                api_key: env
                    .api_key
                    .or(config.api_key.filter(|key| !key.trim().is_empty())),
                verify_tls: config.verify_tls.unwrap_or(true),
            },
            origin_credentials,
            options,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs.unwrap_or(30)),
            upload_idle_timeout: Duration::from_secs(
                config.upload_idle_timeout_secs.unwrap_or(120),
            ),
            staging_dir,
        })
    }
}

pub fn default_staging_dir() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("bioarchive-ingest").join("uploads"))
                .ok()
        })
        .ok_or_else(|| SyncError::Filesystem("unable to resolve cache directory".to_string()))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{ "catalog_base_url": "https://data.example.org/", "staging_dir": "/tmp/staging" }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let resolved = ConfigLoader::resolve_config(minimal(), EnvOverrides::default()).unwrap();
        assert_eq!(resolved.catalog.base_url, "https://data.example.org");
        assert!(resolved.catalog.verify_tls);
        assert!(resolved.options.do_verify);
        assert!(resolved.options.do_upload);
        assert!(!resolved.options.do_delete);
        assert_eq!(resolved.options.worker_pool_size, 8);
        assert_eq!(resolved.probe_timeout, Duration::from_secs(30));
        assert_eq!(resolved.upload_idle_timeout, Duration::from_secs(120));
        assert_eq!(resolved.staging_dir, Utf8PathBuf::from("/tmp/staging"));
    }
}
