use std::fmt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::multipart::Form;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::CatalogSettings;
use crate::domain::Attrs;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogKind {
    Package,
    Resource,
    Organization,
    Group,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Package => "package",
            CatalogKind::Resource => "resource",
            CatalogKind::Organization => "organization",
            CatalogKind::Group => "group",
        }
    }

    /// Resources have no purge action; deleting one is already final.
    fn purge_action(&self) -> Option<&'static str> {
        match self {
            CatalogKind::Package => Some("dataset_purge"),
            CatalogKind::Resource => None,
            CatalogKind::Organization => Some("organization_purge"),
            CatalogKind::Group => Some("group_purge"),
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a `show`: missing records and soft-deleted tombstones are
/// ordinary answers, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Attrs),
    Missing,
    Deleted(Attrs),
}

impl Lookup {
    pub fn from_record(record: Attrs) -> Self {
        if is_deleted(&record) {
            Lookup::Deleted(record)
        } else {
            Lookup::Found(record)
        }
    }
}

/// Soft-deleted records stay visible with `state = "deleted"` until purged.
pub fn is_deleted(record: &Attrs) -> bool {
    record.get("state").and_then(Value::as_str) == Some("deleted")
}

pub trait CatalogApi: Send + Sync {
    fn base_url(&self) -> &str;
    fn show(&self, kind: CatalogKind, id: &str) -> Result<Lookup, SyncError>;
    fn create(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError>;
    fn patch(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError>;
    fn delete(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError>;
    fn purge(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError>;
    fn search_packages(
        &self,
        query: &str,
        rows: usize,
        include_private: bool,
    ) -> Result<Vec<Attrs>, SyncError>;
    /// Attach file bytes to an existing resource record, merging `attrs`.
    fn upload_resource(&self, attrs: &Attrs, file: &Path) -> Result<Attrs, SyncError>;
}

#[derive(Clone)]
pub struct CkanHttpClient {
    client: Client,
    base_url: String,
}

impl CkanHttpClient {
    pub fn new(settings: &CatalogSettings, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .default_headers(default_headers(settings)?)
            .timeout(timeout)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    /// Client for file uploads: no total timeout, only an idle bound.
    pub fn for_uploads(settings: &CatalogSettings, idle: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .default_headers(default_headers(settings)?)
            .timeout(None)
            .connect_timeout(idle)
            .pool_idle_timeout(idle)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    fn with_client(client: Client, settings: &CatalogSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{}", self.base_url, action)
    }

    fn call(
        &self,
        kind: CatalogKind,
        action: &str,
        subject: &str,
        body: &Value,
    ) -> Result<Value, SyncError> {
        let url = self.action_url(action);
        debug!(action, subject, "catalog call");
        let response = self.send_with_retries(|| self.client.post(&url).json(body))?;
        Self::handle_response(response, kind, action, subject)
    }

    fn handle_response(
        response: Response,
        kind: CatalogKind,
        action: &str,
        subject: &str,
    ) -> Result<Value, SyncError> {
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;
        match status {
            StatusCode::NOT_FOUND => {
                return Err(SyncError::CatalogNotFound {
                    kind: kind.to_string(),
                    id: subject.to_string(),
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SyncError::CatalogAuth {
                    action: action.to_string(),
                });
            }
            StatusCode::CONFLICT | StatusCode::BAD_REQUEST => {
                return Err(SyncError::CatalogConflict {
                    action: action.to_string(),
                    message: text,
                });
            }
            status if !status.is_success() => {
                return Err(SyncError::CatalogServer {
                    status: status.as_u16(),
                    message: text,
                });
            }
            _ => {}
        }
        let envelope: Value = serde_json::from_str(&text).map_err(|err| {
            SyncError::CatalogTransport(format!("invalid JSON from {action}: {err}"))
        })?;
        if envelope.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(envelope.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(SyncError::CatalogConflict {
            action: action.to_string(),
            message: envelope
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "catalog reported failure".to_string()),
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SyncError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: u32 = 4;
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0u32;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS << attempt;
                        warn!(
                            status,
                            attempt,
                            delay_ms = delay,
                            "transient catalog error, retrying"
                        );
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS << attempt;
                        warn!(
                            error = %err,
                            attempt,
                            delay_ms = delay,
                            "catalog transport error, retrying"
                        );
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::CatalogTransport(err.to_string()));
                }
            }
        }
    }
}

impl CatalogApi for CkanHttpClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn show(&self, kind: CatalogKind, id: &str) -> Result<Lookup, SyncError> {
        let action = format!("{kind}_show");
        match self.call(kind, &action, id, &json!({ "id": id })) {
            Ok(value) => Ok(Lookup::from_record(into_attrs(value, &action)?)),
            Err(SyncError::CatalogNotFound { .. }) => Ok(Lookup::Missing),
            Err(err) => Err(err),
        }
    }

    fn create(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError> {
        let action = format!("{kind}_create");
        let value = self.call(kind, &action, record_id(attrs), &Value::Object(attrs.clone()))?;
        into_attrs(value, &action)
    }

    fn patch(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError> {
        let action = format!("{kind}_patch");
        let value = self.call(kind, &action, record_id(attrs), &Value::Object(attrs.clone()))?;
        into_attrs(value, &action)
    }

    fn delete(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError> {
        let action = format!("{kind}_delete");
        self.call(kind, &action, id, &json!({ "id": id }))?;
        Ok(())
    }

    fn purge(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError> {
        let action = kind
            .purge_action()
            .ok_or_else(|| SyncError::UnsupportedAction {
                action: format!("{kind}_purge"),
            })?;
        self.call(kind, action, id, &json!({ "id": id }))?;
        Ok(())
    }

    fn search_packages(
        &self,
        query: &str,
        rows: usize,
        include_private: bool,
    ) -> Result<Vec<Attrs>, SyncError> {
        let body = json!({
            "q": query,
            "rows": rows,
            "include_private": include_private,
        });
        let value = self.call(CatalogKind::Package, "package_search", query, &body)?;
        let results = value
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        results
            .into_iter()
            .map(|row| into_attrs(row, "package_search"))
            .collect()
    }

    fn upload_resource(&self, attrs: &Attrs, file: &Path) -> Result<Attrs, SyncError> {
        let mut form = Form::new()
            .file("upload", file)
            .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", file.display())))?;
        for (key, value) in attrs {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
        let id = record_id(attrs);
        info!(resource_id = id, "uploading resource file");
        let response = self
            .client
            .post(self.action_url("resource_patch"))
            .multipart(form)
            .send()
            .map_err(|err| SyncError::CatalogTransport(err.to_string()))?;
        let value = Self::handle_response(response, CatalogKind::Resource, "resource_patch", id)?;
        into_attrs(value, "resource_patch")
    }
}

fn default_headers(settings: &CatalogSettings) -> Result<HeaderMap, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("bioarchive-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?,
    );
    if let Some(api_key) = settings.api_key.as_deref() {
        let mut value = HeaderValue::from_str(api_key)
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn record_id(attrs: &Attrs) -> &str {
    attrs
        .get("id")
        .or_else(|| attrs.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn into_attrs(value: Value, action: &str) -> Result<Attrs, SyncError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::CatalogTransport(format!(
            "{action} returned {other} where an object was expected"
        ))),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Canonical form for comparing a desired value against its catalog copy.
///
/// JSON round-trips through the catalog turn numbers and booleans into
/// strings, so every scalar compares by its string form. Tag lists compare
/// by tag `name` only, order-insensitively.
pub fn normalize_value(key: &str, value: &Value) -> Value {
    if key == "tags" {
        return Value::Array(tag_names(value).into_iter().map(Value::String).collect());
    }
    normalize_scalar(value)
}

fn normalize_scalar(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        Value::String(s) => Value::String(s.clone()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_scalar).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), normalize_scalar(value)))
                .collect(),
        ),
    }
}

fn tag_names(value: &Value) -> Vec<String> {
    let mut names = value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(name.clone()),
                    Value::Object(tag) => {
                        tag.get("name").and_then(Value::as_str).map(str::to_string)
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    names.sort();
    names.dedup();
    names
}

/// Keys of `desired` whose normalized value differs from `remote`.
pub fn differing_keys(remote: &Attrs, desired: &Attrs, skip_keys: &[&str]) -> Vec<String> {
    desired
        .iter()
        .filter(|(key, _)| key.as_str() != "id" && !skip_keys.contains(&key.as_str()))
        .filter(|(key, value)| {
            if remote.get(key.as_str()) == Some(*value) {
                return false;
            }
            let remote_value = remote.get(key.as_str()).unwrap_or(&Value::Null);
            normalize_value(key, remote_value) != normalize_value(key, value)
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Patch `remote` towards `desired` when any non-skipped key differs.
///
/// Returns whether a patch was issued and the catalog's record afterwards.
/// No RPC is made when nothing differs.
pub fn patch_if_required<C: CatalogApi + ?Sized>(
    catalog: &C,
    kind: CatalogKind,
    remote: &Attrs,
    desired: &Attrs,
    skip_keys: &[&str],
) -> Result<(bool, Attrs), SyncError> {
    let differing = differing_keys(remote, desired, skip_keys);
    if differing.is_empty() {
        return Ok((false, remote.clone()));
    }
    let id = desired
        .get("id")
        .or_else(|| remote.get("id"))
        .cloned()
        .unwrap_or(Value::Null);
    debug!(kind = %kind, id = %id, keys = ?differing, "patching");
    let mut body = Attrs::new();
    body.insert("id".to_string(), id);
    for (key, value) in desired {
        if key == "id" || skip_keys.contains(&key.as_str()) {
            continue;
        }
        let value = if key == "tags" {
            Value::Array(
                tag_names(value)
                    .into_iter()
                    .map(|name| json!({ "name": name }))
                    .collect(),
            )
        } else {
            value.clone()
        };
        body.insert(key.clone(), value);
    }
    let updated = catalog.patch(kind, &body)?;
    Ok((true, updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(value: Value) -> Attrs {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn numeric_and_string_forms_compare_equal() {
        let remote = attrs(json!({ "id": "p1", "size": "1024", "private": "true" }));
        let desired = attrs(json!({ "id": "p1", "size": 1024, "private": true }));
        assert!(differing_keys(&remote, &desired, &[]).is_empty());
    }

    #[test]
    fn tags_compare_by_name() {
        let remote = attrs(json!({
            "tags": [
                { "name": "b", "id": "t2", "state": "active" },
                { "name": "a", "id": "t1", "state": "active" }
            ]
        }));
        let desired = attrs(json!({ "tags": [{ "name": "a" }, "b"] }));
        assert!(differing_keys(&remote, &desired, &[]).is_empty());
    }

    #[test]
    fn skipped_and_missing_keys() {
        let remote = attrs(json!({ "id": "r1", "url": "https://catalog/r1" }));
        let desired = attrs(json!({ "id": "r1", "url": "https://origin/r1", "md5": "r1" }));
        assert_eq!(differing_keys(&remote, &desired, &["url"]), vec!["md5"]);
    }

    #[test]
    fn only_throttling_and_server_errors_are_retried() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [200, 400, 401, 403, 404, 409] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn deleted_state_is_a_tombstone() {
        let lookup = Lookup::from_record(attrs(json!({ "id": "p1", "state": "deleted" })));
        assert!(matches!(lookup, Lookup::Deleted(_)));
    }
}
