use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{CatalogApi, is_deleted};
use crate::domain::{Attrs, Package};
use crate::error::SyncError;

/// Read-through snapshot of every extant package of the types under sync,
/// fetched with one search per type. Discarded when the sync ends.
#[derive(Debug, Clone, Default)]
pub struct PackageCache {
    packages: BTreeMap<String, Attrs>,
}

impl PackageCache {
    pub fn fetch<C: CatalogApi + ?Sized>(
        catalog: &C,
        data_type: &str,
        desired: &[Package],
        rows: usize,
    ) -> Result<Self, SyncError> {
        let mut types = BTreeSet::new();
        types.insert(data_type.to_string());
        for package in desired {
            if let Some(kind) = package.attrs().get("type").and_then(Value::as_str) {
                types.insert(kind.to_string());
            }
        }

        let mut packages = BTreeMap::new();
        for kind in &types {
            let results = catalog.search_packages(&format!("type:{kind}"), rows, true)?;
            if results.len() >= rows {
                warn!(
                    data_type = %kind,
                    rows,
                    "search returned the row limit; the snapshot may be incomplete"
                );
            }
            for record in results {
                if let Some(id) = record.get("id").and_then(Value::as_str) {
                    packages.insert(id.to_string(), record);
                }
            }
        }
        info!(data_type, packages = packages.len(), "fetched catalog snapshot");
        Ok(Self { packages })
    }

    pub fn from_records(records: impl IntoIterator<Item = Attrs>) -> Self {
        let packages = records
            .into_iter()
            .filter_map(|record| {
                let id = record.get("id").and_then(Value::as_str)?.to_string();
                Some((id, record))
            })
            .collect();
        Self { packages }
    }

    pub fn get(&self, id: &str) -> Option<&Attrs> {
        self.packages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.packages.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn packages(&self) -> &BTreeMap<String, Attrs> {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Every resource of every live cached package, keyed by resource id,
    /// with `package_id` stamped from its owner. Resources under a tombstone
    /// go away with its purge, so they are not counted as existing.
    pub fn resources(&self) -> BTreeMap<String, Attrs> {
        let mut flattened = BTreeMap::new();
        for (package_id, package) in &self.packages {
            if is_deleted(package) {
                continue;
            }
            for resource in package_resources(package) {
                let Some(id) = resource.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let mut resource = resource.clone();
                resource.insert("package_id".to_string(), Value::String(package_id.clone()));
                flattened.insert(id.to_string(), resource);
            }
        }
        flattened
    }
}

pub fn package_resources(package: &Attrs) -> Vec<&Attrs> {
    package
        .get("resources")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}
