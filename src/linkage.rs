use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::domain::{
    DataTypeDescriptor, LinkageTuple, Package, Resource, ResourceTriple, filename_from_url,
    ticket_segment,
};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingResource {
    pub filename: String,
    pub ticket: String,
    pub linkage: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QcReport {
    pub duplicate_ids: Vec<String>,
    pub dangling_resources: Vec<DanglingResource>,
    pub dangling_packages: Vec<String>,
}

impl QcReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_ids.is_empty()
            && self.dangling_resources.is_empty()
            && self.dangling_packages.is_empty()
    }
}

/// `linkage -> package id` for one data-type.
#[derive(Debug, Clone, Default)]
pub struct LinkageIndex {
    by_linkage: BTreeMap<LinkageTuple, String>,
}

impl LinkageIndex {
    pub fn build(packages: &[Package], keys: &[String]) -> Result<Self, SyncError> {
        let mut by_linkage: BTreeMap<LinkageTuple, String> = BTreeMap::new();
        for package in packages {
            let linkage = package.linkage(keys)?;
            if let Some(first) = by_linkage.get(&linkage) {
                return Err(SyncError::LinkageCollision {
                    linkage: linkage.values().to_vec(),
                    first: first.clone(),
                    second: package.id().to_string(),
                });
            }
            by_linkage.insert(linkage, package.id().to_string());
        }
        Ok(Self { by_linkage })
    }

    pub fn package_for(&self, linkage: &LinkageTuple) -> Option<&str> {
        self.by_linkage.get(linkage).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_linkage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_linkage.is_empty()
    }
}

/// Normalized desired state: packages unique by id, resources wired to
/// exactly one package.
#[derive(Debug, Clone)]
pub struct QcOutcome {
    pub packages: Vec<Package>,
    pub resources: Vec<Resource>,
    pub index: LinkageIndex,
    pub report: QcReport,
}

/// Drop every copy of any package id that appears more than once.
pub fn collapse_packages(packages: Vec<Package>, report: &mut QcReport) -> Vec<Package> {
    let mut counts = BTreeMap::<String, usize>::new();
    for package in &packages {
        *counts.entry(package.id().to_string()).or_default() += 1;
    }
    for (id, count) in &counts {
        if *count > 1 {
            error!(
                critical = true,
                package_id = %id,
                copies = count,
                "duplicate package id, excluded from sync"
            );
            report.duplicate_ids.push(id.clone());
        }
    }
    packages
        .into_iter()
        .filter(|package| counts.get(package.id()).copied() == Some(1))
        .collect()
}

/// Run every linkage check and wire resources to their packages.
///
/// Hard errors: linkage collisions, duplicate or missing md5. Dangling
/// resources are excluded and dangling packages kept; both are reported.
pub fn check_linkage(
    descriptor: &DataTypeDescriptor,
    packages: Vec<Package>,
    triples: Vec<ResourceTriple>,
) -> Result<QcOutcome, SyncError> {
    let mut report = QcReport::default();
    let packages = collapse_packages(packages, &mut report);
    let index = LinkageIndex::build(&packages, &descriptor.resource_linkage)?;

    ensure_unique_md5(&triples)?;

    let mut linked = BTreeSet::new();
    let mut resources = Vec::with_capacity(triples.len());
    for triple in triples {
        let Some(package_id) = index.package_for(&triple.linkage) else {
            let dangling = DanglingResource {
                filename: triple.filename().to_string(),
                ticket: ticket_segment(&triple.origin_url).to_string(),
                linkage: triple.linkage.values().to_vec(),
            };
            error!(
                filename = %dangling.filename,
                ticket = %dangling.ticket,
                linkage = %triple.linkage,
                "dangling resource: no package matches its linkage"
            );
            report.dangling_resources.push(dangling);
            continue;
        };
        linked.insert(triple.linkage.clone());
        resources.push(wire(triple, package_id));
    }

    for package in &packages {
        let linkage = package.linkage(&descriptor.resource_linkage)?;
        if !linked.contains(&linkage) {
            error!(
                package_id = package.id(),
                linkage = %linkage,
                "package has no linked resources"
            );
            report.dangling_packages.push(package.id().to_string());
        }
    }

    resources.sort_by(|a, b| {
        (a.package_id(), a.filename(), a.id()).cmp(&(b.package_id(), b.filename(), b.id()))
    });

    Ok(QcOutcome {
        packages,
        resources,
        index,
        report,
    })
}

fn ensure_unique_md5(triples: &[ResourceTriple]) -> Result<(), SyncError> {
    let mut by_md5 = BTreeMap::<&str, Vec<&ResourceTriple>>::new();
    for triple in triples {
        let Some(md5) = triple.md5().filter(|md5| !md5.is_empty()) else {
            return Err(SyncError::MissingResourceMd5 {
                filename: triple.filename().to_string(),
                ticket: ticket_segment(&triple.origin_url).to_string(),
            });
        };
        by_md5.entry(md5).or_default().push(triple);
    }
    for (md5, claimants) in by_md5 {
        if claimants.len() > 1 {
            let filenames = claimants
                .iter()
                .map(|triple| {
                    format!(
                        "{} ({})",
                        triple.filename(),
                        ticket_segment(&triple.origin_url)
                    )
                })
                .collect::<Vec<_>>();
            error!(critical = true, md5, ?filenames, "duplicate resource md5");
            return Err(SyncError::DuplicateResourceMd5 {
                md5: md5.to_string(),
                filenames,
            });
        }
    }
    Ok(())
}

fn wire(triple: ResourceTriple, package_id: &str) -> Resource {
    let mut attrs = triple.attrs;
    let md5 = attrs.get("md5").cloned().unwrap_or(Value::Null);
    attrs.insert("id".to_string(), md5);
    attrs.insert("package_id".to_string(), Value::String(package_id.to_string()));
    attrs
        .entry("url")
        .or_insert_with(|| Value::String(triple.origin_url.clone()));
    if !attrs.contains_key("name") {
        let filename = filename_from_url(&triple.origin_url).to_string();
        attrs.insert("name".to_string(), Value::String(filename));
    }
    Resource {
        origin_url: triple.origin_url,
        attrs,
    }
}
