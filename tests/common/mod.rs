#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Mutex;

use serde_json::{Value, json};

use bioarchive_ingest::catalog::{CatalogApi, CatalogKind, Lookup};
use bioarchive_ingest::domain::Attrs;
use bioarchive_ingest::error::SyncError;
use bioarchive_ingest::probe::{ArchiveProbe, ProbeError, ProbeResult};
use bioarchive_ingest::upload::OriginSource;

pub const CATALOG_URL: &str = "https://catalog.test";

pub fn attrs(value: Value) -> Attrs {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

pub fn hosted_url(package_id: &str, resource_id: &str, name: &str) -> String {
    format!("{CATALOG_URL}/dataset/{package_id}/resource/{resource_id}/download/{name}")
}

#[derive(Default)]
struct CatalogState {
    packages: BTreeMap<String, Attrs>,
    resources: BTreeMap<String, Attrs>,
    calls: Vec<String>,
    uploads: BTreeMap<String, Vec<u8>>,
    search_returns_deleted: bool,
}

/// In-memory catalog that records every call as `"<kind>.<action> <id>"`.
#[derive(Default)]
pub struct MockCatalog {
    state: Mutex<CatalogState>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a package; any `resources` array is split out into resource
    /// records.
    pub fn insert_package(&self, mut package: Attrs) {
        let mut state = self.state.lock().unwrap();
        let id = package["id"].as_str().unwrap().to_string();
        if let Some(Value::Array(resources)) = package.remove("resources") {
            for resource in resources {
                let mut resource = attrs(resource);
                resource.insert("package_id".to_string(), Value::String(id.clone()));
                let rid = resource["id"].as_str().unwrap().to_string();
                state.resources.insert(rid, resource);
            }
        }
        package
            .entry("state")
            .or_insert_with(|| Value::String("active".to_string()));
        state.packages.insert(id, package);
    }

    /// Some catalogs index soft-deleted packages until they are purged.
    pub fn search_returns_deleted(&self) {
        self.state.lock().unwrap().search_returns_deleted = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                [".create", ".patch", ".delete", ".purge", ".upload"]
                    .iter()
                    .any(|action| call.contains(action))
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn package(&self, id: &str) -> Option<Attrs> {
        let state = self.state.lock().unwrap();
        state
            .packages
            .get(id)
            .map(|package| with_resources(&state, package))
    }

    pub fn resource(&self, id: &str) -> Option<Attrs> {
        self.state.lock().unwrap().resources.get(id).cloned()
    }

    pub fn uploaded_bytes(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().uploads.get(id).cloned()
    }

    fn log(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn with_resources(state: &CatalogState, package: &Attrs) -> Attrs {
    let id = package["id"].as_str().unwrap_or("");
    let resources = state
        .resources
        .values()
        .filter(|resource| resource.get("package_id").and_then(Value::as_str) == Some(id))
        .cloned()
        .map(Value::Object)
        .collect::<Vec<_>>();
    let mut package = package.clone();
    package.insert("resources".to_string(), Value::Array(resources));
    package
}

fn id_of(attrs: &Attrs) -> String {
    attrs
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

impl CatalogApi for MockCatalog {
    fn base_url(&self) -> &str {
        CATALOG_URL
    }

    fn show(&self, kind: CatalogKind, id: &str) -> Result<Lookup, SyncError> {
        self.log(format!("{kind}.show {id}"));
        let state = self.state.lock().unwrap();
        let record = match kind {
            CatalogKind::Package => state
                .packages
                .get(id)
                .map(|package| with_resources(&state, package)),
            CatalogKind::Resource => state.resources.get(id).cloned(),
            _ => None,
        };
        Ok(record.map(Lookup::from_record).unwrap_or(Lookup::Missing))
    }

    fn create(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError> {
        let id = id_of(attrs);
        self.log(format!("{kind}.create {id}"));
        let mut state = self.state.lock().unwrap();
        match kind {
            CatalogKind::Package => {
                if state.packages.contains_key(&id) {
                    return Err(SyncError::CatalogConflict {
                        action: "package_create".to_string(),
                        message: format!("{id} already exists"),
                    });
                }
                let mut record = attrs.clone();
                record.insert("state".to_string(), json!("active"));
                state.packages.insert(id, record.clone());
                Ok(record)
            }
            CatalogKind::Resource => {
                let package_id = attrs["package_id"].as_str().unwrap_or("").to_string();
                if !state.packages.contains_key(&package_id) {
                    return Err(SyncError::CatalogNotFound {
                        kind: "package".to_string(),
                        id: package_id,
                    });
                }
                state.resources.insert(id, attrs.clone());
                Ok(attrs.clone())
            }
            _ => Ok(attrs.clone()),
        }
    }

    fn patch(&self, kind: CatalogKind, attrs: &Attrs) -> Result<Attrs, SyncError> {
        let id = id_of(attrs);
        self.log(format!("{kind}.patch {id}"));
        let mut state = self.state.lock().unwrap();
        let records = match kind {
            CatalogKind::Package => &mut state.packages,
            _ => &mut state.resources,
        };
        let Some(record) = records.get_mut(&id) else {
            return Err(SyncError::CatalogNotFound {
                kind: kind.to_string(),
                id,
            });
        };
        for (key, value) in attrs {
            record.insert(key.clone(), value.clone());
        }
        let record = record.clone();
        match kind {
            CatalogKind::Package => Ok(with_resources(&state, &record)),
            _ => Ok(record),
        }
    }

    fn delete(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError> {
        self.log(format!("{kind}.delete {id}"));
        let mut state = self.state.lock().unwrap();
        match kind {
            CatalogKind::Package => {
                if let Some(package) = state.packages.get_mut(id) {
                    package.insert("state".to_string(), json!("deleted"));
                }
            }
            _ => {
                state.resources.remove(id);
            }
        }
        Ok(())
    }

    fn purge(&self, kind: CatalogKind, id: &str) -> Result<(), SyncError> {
        self.log(format!("{kind}.purge {id}"));
        let mut state = self.state.lock().unwrap();
        state.packages.remove(id);
        state
            .resources
            .retain(|_, resource| resource.get("package_id").and_then(Value::as_str) != Some(id));
        Ok(())
    }

    fn search_packages(
        &self,
        query: &str,
        rows: usize,
        _include_private: bool,
    ) -> Result<Vec<Attrs>, SyncError> {
        self.log(format!("package.search {query}"));
        let data_type = query.trim_start_matches("type:");
        let state = self.state.lock().unwrap();
        Ok(state
            .packages
            .values()
            .filter(|package| package.get("type").and_then(Value::as_str) == Some(data_type))
            .filter(|package| {
                state.search_returns_deleted
                    || package.get("state").and_then(Value::as_str) != Some("deleted")
            })
            .take(rows)
            .map(|package| with_resources(&state, package))
            .collect())
    }

    fn upload_resource(&self, attrs: &Attrs, file: &Path) -> Result<Attrs, SyncError> {
        let id = id_of(attrs);
        self.log(format!("resource.upload {id}"));
        let bytes = fs::read(file).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut state = self.state.lock().unwrap();
        state.uploads.insert(id.clone(), bytes);
        let Some(record) = state.resources.get_mut(&id) else {
            return Err(SyncError::CatalogNotFound {
                kind: "resource".to_string(),
                id,
            });
        };
        for (key, value) in attrs {
            record.insert(key.clone(), value.clone());
        }
        let package_id = record["package_id"].as_str().unwrap_or("").to_string();
        let name = record["name"].as_str().unwrap_or("").to_string();
        record.insert(
            "url".to_string(),
            Value::String(hosted_url(&package_id, &id, &name)),
        );
        Ok(record.clone())
    }
}

/// Scripted probe: each URL answers from a queue whose last entry repeats.
/// Unknown URLs answer `NotFound`.
#[derive(Default)]
pub struct MockProbe {
    responses: Mutex<BTreeMap<String, VecDeque<Result<ProbeResult, ProbeError>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, result: Result<ProbeResult, ProbeError>) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        let Some(queue) = responses.get_mut(url) else {
            return Err(ProbeError::NotFound);
        };
        if queue.len() > 1 {
            return queue.pop_front().unwrap();
        }
        queue.front().cloned().unwrap_or(Err(ProbeError::NotFound))
    }
}

impl ArchiveProbe for MockProbe {
    fn probe_catalog(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        self.answer(url)
    }

    fn probe_origin(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        self.answer(url)
    }
}

#[derive(Default)]
pub struct MockOrigin {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    opened: Mutex<Vec<String>>,
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, bytes: &[u8]) -> &Self {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl OriginSource for MockOrigin {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        self.opened.lock().unwrap().push(url.to_string());
        match self.files.lock().unwrap().get(url) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(SyncError::OriginStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
