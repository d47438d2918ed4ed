use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{
    Attrs, DataTypeDescriptor, LinkageTuple, Package, ResourceTriple, make_package_id,
    scalar_string,
};
use crate::error::SyncError;

/// Upstream source of desired state for one data-type.
pub trait DataTypeProducer {
    fn descriptor(&self) -> &DataTypeDescriptor;
    fn produce_packages(&self) -> Result<Vec<Package>, SyncError>;
    fn produce_resources(&self) -> Result<Vec<ResourceTriple>, SyncError>;
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    data_type: String,
    organization: String,
    resource_linkage: Vec<String>,
    #[serde(default)]
    packages: Vec<Attrs>,
    #[serde(default)]
    resources: Vec<ManifestResource>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestResource {
    linkage: LinkageValues,
    url: String,
    #[serde(default)]
    attrs: Attrs,
}

/// Either positional values or an object keyed by linkage field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LinkageValues {
    Positional(Vec<Value>),
    Keyed(Attrs),
}

/// Desired state read from a JSON manifest on disk.
#[derive(Debug, Clone)]
pub struct ManifestProducer {
    descriptor: DataTypeDescriptor,
    packages: Vec<Attrs>,
    resources: Vec<ManifestResource>,
}

impl ManifestProducer {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let contents = fs::read_to_string(path).map_err(|err| SyncError::ManifestRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_json(&contents).map_err(|err| match err {
            SyncError::ManifestRead { message, .. } => SyncError::ManifestRead {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_json(contents: &str) -> Result<Self, SyncError> {
        let manifest: Manifest =
            serde_json::from_str(contents).map_err(|err| SyncError::ManifestRead {
                path: Default::default(),
                message: err.to_string(),
            })?;
        if manifest.data_type.trim().is_empty() {
            return Err(SyncError::ManifestRead {
                path: Default::default(),
                message: "data_type must not be empty".to_string(),
            });
        }
        Ok(Self {
            descriptor: DataTypeDescriptor {
                data_type: manifest.data_type,
                organization: manifest.organization,
                resource_linkage: manifest.resource_linkage,
            },
            packages: manifest.packages,
            resources: manifest.resources,
        })
    }

    fn stamp_package(&self, mut attrs: Attrs) -> Result<Package, SyncError> {
        let descriptor = &self.descriptor;
        attrs.insert(
            "type".to_string(),
            Value::String(descriptor.data_type.clone()),
        );
        attrs.insert(
            "owner_org".to_string(),
            Value::String(descriptor.organization.clone()),
        );
        if !attrs.contains_key("id") {
            let linkage = Package::new(attrs.clone()).linkage(&descriptor.resource_linkage)?;
            let id = make_package_id(&descriptor.data_type, &linkage);
            attrs.insert("id".to_string(), Value::String(id));
        }
        if !attrs.contains_key("name") {
            let id = attrs.get("id").cloned().unwrap_or(Value::Null);
            attrs.insert("name".to_string(), id);
        }
        Ok(Package::new(attrs))
    }

    fn linkage_tuple(&self, values: &LinkageValues, url: &str) -> Result<LinkageTuple, SyncError> {
        match values {
            LinkageValues::Positional(values) => {
                Ok(LinkageTuple::new(values.iter().map(scalar_string)))
            }
            LinkageValues::Keyed(map) => self
                .descriptor
                .resource_linkage
                .iter()
                .map(|key| {
                    map.get(key)
                        .map(scalar_string)
                        .ok_or_else(|| SyncError::MissingLinkageKey {
                            package: url.to_string(),
                            key: key.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(LinkageTuple::new),
        }
    }
}

impl DataTypeProducer for ManifestProducer {
    fn descriptor(&self) -> &DataTypeDescriptor {
        &self.descriptor
    }

    fn produce_packages(&self) -> Result<Vec<Package>, SyncError> {
        self.packages
            .iter()
            .cloned()
            .map(|attrs| self.stamp_package(attrs))
            .collect()
    }

    fn produce_resources(&self) -> Result<Vec<ResourceTriple>, SyncError> {
        self.resources
            .iter()
            .map(|resource| {
                Ok(ResourceTriple {
                    linkage: self.linkage_tuple(&resource.linkage, &resource.url)?,
                    origin_url: resource.url.clone(),
                    attrs: resource.attrs.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "data_type": "amdb-genomics",
        "organization": "bpa-amdb",
        "resource_linkage": ["sample_id", "flowcell"],
        "packages": [
            {"sample_id": "102.100.100/1234", "flowcell": "HXYZ", "title": "Soil"}
        ],
        "resources": [
            {
                "linkage": ["102.100.100/1234", "HXYZ"],
                "url": "https://downloads.example.org/amd/T1/a_R1.fastq.gz",
                "attrs": {"md5": "0123456789abcdef0123456789abcdef"}
            },
            {
                "linkage": {"flowcell": "HXYZ", "sample_id": "102.100.100/1234"},
                "url": "https://downloads.example.org/amd/T1/a_R2.fastq.gz",
                "attrs": {"md5": "fedcba9876543210fedcba9876543210"}
            }
        ]
    }"#;

    #[test]
    fn derives_ids_and_stamps_descriptor() {
        let producer = ManifestProducer::from_json(MANIFEST).unwrap();
        let packages = producer.produce_packages().unwrap();
        assert_eq!(packages.len(), 1);
        let package = &packages[0];
        assert_eq!(package.id(), "amdb-genomics-102_100_100_1234-hxyz");
        assert_eq!(package.name(), package.id());
        assert_eq!(package.attrs()["type"], "amdb-genomics");
        assert_eq!(package.attrs()["owner_org"], "bpa-amdb");
    }

    #[test]
    fn keyed_linkage_follows_descriptor_order() {
        let producer = ManifestProducer::from_json(MANIFEST).unwrap();
        let resources = producer.produce_resources().unwrap();
        assert_eq!(resources[0].linkage, resources[1].linkage);
        assert_eq!(
            resources[1].linkage.values(),
            ["102.100.100/1234".to_string(), "HXYZ".to_string()]
        );
    }

    #[test]
    fn rejects_malformed_manifest() {
        let err = ManifestProducer::from_json("{\"data_type\": 1}").unwrap_err();
        assert!(matches!(err, SyncError::ManifestRead { .. }));
    }
}
