//! Reconciliation of computed desired state against the live catalog.
//!
//! One sync runs in fixed phases: linkage QC and resource wiring (no RPCs),
//! a bulk snapshot of the catalog, package create and patch, resource
//! verification, per-package resource create/patch/delete, package deletes,
//! then re-uploads. Every catalog mutation is issued from the calling
//! thread, in lexical package-name order; only read-only probes and the
//! per-resource uploads run on worker pools.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cache::{PackageCache, package_resources};
use crate::catalog::{CatalogApi, CatalogKind, Lookup, is_deleted, patch_if_required};
use crate::domain::{Attrs, DataTypeDescriptor, Package, Resource, ResourceTriple};
use crate::error::SyncError;
use crate::linkage::{QcReport, check_linkage};
use crate::probe::ArchiveProbe;
use crate::producer::DataTypeProducer;
use crate::upload::{OriginSource, Uploader};
use crate::verify::{ResourceVerifier, Verdict, VerifyItem};

pub const DEFAULT_SEARCH_ROWS: usize = 50_000;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

const PACKAGE_SKELETON_KEYS: &[&str] = &[
    "id",
    "name",
    "type",
    "owner_org",
    "private",
    "resource_permissions",
];
const PACKAGE_SKIP_KEYS: &[&str] = &["resources"];
// `url` belongs to create and upload; patching it would undo uploads.
const RESOURCE_SKIP_KEYS: &[&str] = &["url"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub do_verify: bool,
    pub do_upload: bool,
    pub do_delete: bool,
    pub worker_pool_size: usize,
    pub search_rows: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            do_verify: true,
            do_upload: true,
            do_delete: false,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            search_rows: DEFAULT_SEARCH_ROWS,
        }
    }
}

/// Shared cancellation flag, checked before every mutation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFailure {
    pub resource_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub data_type: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub created: Vec<String>,
    pub patched: Vec<String>,
    pub deleted: Vec<String>,
    pub purged: Vec<String>,
    pub delete_candidates: Vec<String>,
    pub resource_delete_candidates: Vec<String>,
    pub verified: usize,
    pub needs_reupload: Vec<String>,
    pub uploaded: Vec<String>,
    pub upload_failures: Vec<UploadFailure>,
    pub mutations: usize,
    pub qc: QcReport,
}

/// Per-sync state threaded through every phase.
#[derive(Debug)]
pub struct SyncContext {
    pub options: SyncOptions,
    pub report: SyncReport,
    cancel: CancelToken,
}

impl SyncContext {
    pub fn new(data_type: &str, options: SyncOptions, cancel: CancelToken) -> Self {
        Self {
            options,
            report: SyncReport {
                data_type: data_type.to_string(),
                started_at: Utc::now().to_rfc3339(),
                ..SyncReport::default()
            },
            cancel,
        }
    }

    /// Gate in front of every catalog mutation.
    fn begin_mutation(&mut self) -> Result<(), SyncError> {
        self.begin_check()?;
        self.report.mutations += 1;
        Ok(())
    }

    /// Cancellation point before a compare-then-maybe-patch; counts nothing.
    fn begin_check(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn into_report(mut self) -> SyncReport {
        self.report.finished_at = Some(Utc::now().to_rfc3339());
        self.report
    }
}

pub struct Reconciler<'a> {
    catalog: &'a dyn CatalogApi,
    upload_catalog: &'a dyn CatalogApi,
    probe: &'a dyn ArchiveProbe,
    origin: &'a dyn OriginSource,
    staging_dir: PathBuf,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        catalog: &'a dyn CatalogApi,
        probe: &'a dyn ArchiveProbe,
        origin: &'a dyn OriginSource,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            upload_catalog: catalog,
            probe,
            origin,
            staging_dir: staging_dir.into(),
        }
    }

    /// Route uploads through a separate client, e.g. one with an idle
    /// timeout instead of a total one.
    pub fn with_upload_catalog(mut self, catalog: &'a dyn CatalogApi) -> Self {
        self.upload_catalog = catalog;
        self
    }

    pub fn sync_producer(
        &self,
        producer: &dyn DataTypeProducer,
        options: SyncOptions,
        cancel: &CancelToken,
    ) -> Result<SyncReport, SyncError> {
        let packages = producer.produce_packages()?;
        let triples = producer.produce_resources()?;
        self.sync(producer.descriptor(), packages, triples, options, cancel)
    }

    pub fn sync(
        &self,
        descriptor: &DataTypeDescriptor,
        packages: Vec<Package>,
        triples: Vec<ResourceTriple>,
        options: SyncOptions,
        cancel: &CancelToken,
    ) -> Result<SyncReport, SyncError> {
        let mut ctx = SyncContext::new(&descriptor.data_type, options, cancel.clone());
        info!(
            data_type = %descriptor.data_type,
            packages = packages.len(),
            resources = triples.len(),
            "starting sync"
        );
        match self.run(descriptor, packages, triples, &mut ctx) {
            Ok(()) => {
                let report = ctx.into_report();
                info!(
                    data_type = %report.data_type,
                    created = report.created.len(),
                    patched = report.patched.len(),
                    deleted = report.deleted.len(),
                    uploaded = report.uploaded.len(),
                    mutations = report.mutations,
                    "sync finished"
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    data_type = %ctx.report.data_type,
                    error = %err,
                    created = ?ctx.report.created,
                    patched = ?ctx.report.patched,
                    deleted = ?ctx.report.deleted,
                    mutations = ctx.report.mutations,
                    "sync aborted"
                );
                Err(err)
            }
        }
    }

    fn run(
        &self,
        descriptor: &DataTypeDescriptor,
        packages: Vec<Package>,
        triples: Vec<ResourceTriple>,
        ctx: &mut SyncContext,
    ) -> Result<(), SyncError> {
        let qc = check_linkage(descriptor, packages, triples)?;
        ctx.report.qc = qc.report;
        let mut desired = qc.packages;
        desired.sort_by(|a, b| a.name().cmp(b.name()));
        let resources = qc.resources;

        let snapshot = PackageCache::fetch(
            self.catalog,
            &descriptor.data_type,
            &desired,
            ctx.options.search_rows,
        )?;
        let existing_resources = snapshot.resources();

        let desired_ids = desired
            .iter()
            .map(|package| package.id().to_string())
            .collect::<BTreeSet<_>>();
        let delete_candidates = self.package_delete_candidates(&snapshot, &desired_ids, ctx);

        let remote_packages = self.sync_packages(descriptor, &desired, &snapshot, ctx)?;

        let mut needs_reupload = BTreeSet::new();
        if ctx.options.do_verify {
            needs_reupload.extend(self.verify_existing(&resources, &existing_resources, ctx)?);
        }

        let mut by_package = BTreeMap::<&str, Vec<&Resource>>::new();
        for resource in &resources {
            by_package
                .entry(resource.package_id())
                .or_default()
                .push(resource);
        }
        let desired_resource_ids = resources
            .iter()
            .map(|resource| resource.id())
            .collect::<BTreeSet<_>>();
        for package in &desired {
            let wanted = by_package.remove(package.id()).unwrap_or_default();
            let remote = remote_packages.get(package.id());
            let created = self.sync_package_resources(
                package,
                remote,
                &wanted,
                &existing_resources,
                &desired_resource_ids,
                ctx,
            )?;
            needs_reupload.extend(created);
        }

        if ctx.options.do_delete {
            for (id, _) in &delete_candidates {
                ctx.begin_mutation()?;
                self.catalog.delete(CatalogKind::Package, id)?;
                info!(package_id = %id, "deleted package");
                ctx.report.deleted.push(id.clone());
            }
        }

        ctx.report.needs_reupload = needs_reupload.iter().cloned().collect();
        if ctx.options.do_upload && !needs_reupload.is_empty() {
            let queue = resources
                .iter()
                .filter(|resource| needs_reupload.contains(resource.id()))
                .collect::<Vec<_>>();
            self.reupload(&queue, ctx)?;
        }
        Ok(())
    }

    /// Current packages with no desired counterpart, ordered by name.
    fn package_delete_candidates(
        &self,
        snapshot: &PackageCache,
        desired_ids: &BTreeSet<String>,
        ctx: &mut SyncContext,
    ) -> Vec<(String, String)> {
        let mut candidates = snapshot
            .packages()
            .iter()
            .filter(|(id, record)| !desired_ids.contains(*id) && !is_deleted(record))
            .map(|(id, record)| {
                let name = record
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(id.as_str())
                    .to_string();
                (id.clone(), name)
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (id, name) in &candidates {
            if !ctx.options.do_delete {
                info!(
                    package_id = %id,
                    name = %name,
                    "package no longer desired; deletion not enabled"
                );
            }
            ctx.report.delete_candidates.push(id.clone());
        }
        candidates
    }

    /// Create missing packages, then patch every desired package. Returns
    /// the catalog's view of each desired package afterwards.
    fn sync_packages(
        &self,
        descriptor: &DataTypeDescriptor,
        desired: &[Package],
        snapshot: &PackageCache,
        ctx: &mut SyncContext,
    ) -> Result<BTreeMap<String, Attrs>, SyncError> {
        let mut remote = BTreeMap::new();
        let mut created = BTreeSet::new();
        for package in desired {
            let attrs = desired_package_attrs(descriptor, package);
            let record = match snapshot.get(package.id()).filter(|record| !is_deleted(record)) {
                Some(record) => record.clone(),
                None => {
                    let (record, was_created) = self.ensure_package(&attrs, ctx)?;
                    if was_created {
                        created.insert(package.id().to_string());
                    }
                    record
                }
            };
            remote.insert(package.id().to_string(), record);
        }

        for package in desired {
            let attrs = desired_package_attrs(descriptor, package);
            let Some(current) = remote.get(package.id()) else {
                continue;
            };
            ctx.begin_check()?;
            let (patched, updated) = patch_if_required(
                self.catalog,
                CatalogKind::Package,
                current,
                &attrs,
                PACKAGE_SKIP_KEYS,
            )?;
            if patched {
                ctx.report.mutations += 1;
                if !created.contains(package.id()) {
                    info!(package_id = package.id(), "patched package");
                    ctx.report.patched.push(package.id().to_string());
                }
                // Some catalogs omit resources from patch responses.
                let mut updated = updated;
                if let Some(resources) = current.get("resources") {
                    updated
                        .entry("resources")
                        .or_insert_with(|| resources.clone());
                }
                remote.insert(package.id().to_string(), updated);
            }
        }
        Ok(remote)
    }

    /// Resolve a package absent from the snapshot: reuse it if it exists,
    /// purge a soft-deleted tombstone, then create from the skeleton.
    fn ensure_package(
        &self,
        attrs: &Attrs,
        ctx: &mut SyncContext,
    ) -> Result<(Attrs, bool), SyncError> {
        let id = attrs.get("id").and_then(Value::as_str).unwrap_or("");
        match self.catalog.show(CatalogKind::Package, id)? {
            Lookup::Found(record) => {
                warn!(package_id = id, "package exists but was not in the snapshot");
                return Ok((record, false));
            }
            Lookup::Deleted(_) => {
                ctx.begin_mutation()?;
                self.catalog.purge(CatalogKind::Package, id)?;
                info!(package_id = id, "purged soft-deleted package before recreation");
                ctx.report.purged.push(id.to_string());
            }
            Lookup::Missing => {}
        }
        let skeleton = PACKAGE_SKELETON_KEYS
            .iter()
            .filter_map(|key| attrs.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect::<Attrs>();
        ctx.begin_mutation()?;
        let record = self.catalog.create(CatalogKind::Package, &skeleton)?;
        info!(package_id = id, "created package");
        ctx.report.created.push(id.to_string());
        Ok((record, true))
    }

    fn verify_existing(
        &self,
        resources: &[Resource],
        existing: &BTreeMap<String, Attrs>,
        ctx: &mut SyncContext,
    ) -> Result<Vec<String>, SyncError> {
        let items = resources
            .iter()
            .filter_map(|resource| {
                existing.get(resource.id()).map(|remote| VerifyItem {
                    remote,
                    origin_url: &resource.origin_url,
                })
            })
            .collect::<Vec<_>>();
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let verifier = ResourceVerifier::new(
            self.probe,
            self.catalog.base_url(),
            ctx.options.worker_pool_size,
        );
        let verifications = verifier.verify(&items)?;
        ctx.report.verified += verifications.len();
        let flagged = verifications
            .into_iter()
            .filter(|verification| verification.verdict != Verdict::Ok)
            .map(|verification| verification.resource_id)
            .collect::<Vec<_>>();
        info!(
            checked = items.len(),
            flagged = flagged.len(),
            "verified extant resources"
        );
        Ok(flagged)
    }

    /// Creates precede patches precede deletes. Returns the ids of resources
    /// created here, which still need their bytes uploaded.
    fn sync_package_resources(
        &self,
        package: &Package,
        remote_package: Option<&Attrs>,
        wanted: &[&Resource],
        existing: &BTreeMap<String, Attrs>,
        desired_ids: &BTreeSet<&str>,
        ctx: &mut SyncContext,
    ) -> Result<Vec<String>, SyncError> {
        let mut created = Vec::new();
        for resource in wanted.iter().filter(|r| !existing.contains_key(r.id())) {
            ctx.begin_mutation()?;
            self.catalog
                .create(CatalogKind::Resource, &resource_skeleton(resource))?;
            info!(
                resource_id = resource.id(),
                package_id = package.id(),
                filename = resource.filename(),
                "created resource"
            );
            ctx.report.created.push(resource.id().to_string());
            created.push(resource.id().to_string());
        }

        let mut current = remote_package.map(resource_map).unwrap_or_default();
        if !created.is_empty() {
            match self.catalog.show(CatalogKind::Package, package.id())? {
                Lookup::Found(record) => current = resource_map(&record),
                _ => {
                    return Err(SyncError::CatalogNotFound {
                        kind: CatalogKind::Package.to_string(),
                        id: package.id().to_string(),
                    });
                }
            }
        }

        for resource in wanted {
            let remote = current
                .get(resource.id())
                .or_else(|| existing.get(resource.id()))
                .cloned()
                .unwrap_or_default();
            ctx.begin_check()?;
            let (patched, _) = patch_if_required(
                self.catalog,
                CatalogKind::Resource,
                &remote,
                &resource.attrs,
                RESOURCE_SKIP_KEYS,
            )?;
            if patched {
                ctx.report.mutations += 1;
                if !created.iter().any(|id| id == resource.id()) {
                    info!(resource_id = resource.id(), "patched resource");
                    ctx.report.patched.push(resource.id().to_string());
                }
            }
        }

        let stale = current
            .keys()
            .filter(|id| !desired_ids.contains(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            if ctx.options.do_delete {
                ctx.begin_mutation()?;
                self.catalog.delete(CatalogKind::Resource, &id)?;
                info!(resource_id = %id, package_id = package.id(), "deleted resource");
                ctx.report.deleted.push(id);
            } else {
                info!(
                    resource_id = %id,
                    package_id = package.id(),
                    "resource no longer desired; deletion not enabled"
                );
                ctx.report.resource_delete_candidates.push(id);
            }
        }
        Ok(created)
    }

    fn reupload(&self, queue: &[&Resource], ctx: &mut SyncContext) -> Result<(), SyncError> {
        info!(resources = queue.len(), "uploading resource bytes");
        let uploader = Uploader::new(self.upload_catalog, self.origin, self.staging_dir.clone());
        let outcomes = uploader.upload_all(queue, ctx.options.worker_pool_size, &ctx.cancel)?;
        let mut fatal = None;
        for (resource_id, outcome) in outcomes {
            match outcome {
                Ok(uploaded) => {
                    ctx.report.mutations += uploaded.mutations();
                    ctx.report.uploaded.push(resource_id);
                }
                Err(err) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    warn!(resource_id = %resource_id, error = %err, "upload failed");
                    ctx.report.upload_failures.push(UploadFailure {
                        resource_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Full attribute set for a desired package, with `type`, `owner_org` and
/// `name` defaulted from the descriptor and id.
pub fn desired_package_attrs(descriptor: &DataTypeDescriptor, package: &Package) -> Attrs {
    let mut attrs = package.attrs().clone();
    attrs.remove("resources");
    attrs
        .entry("type")
        .or_insert_with(|| Value::String(descriptor.data_type.clone()));
    attrs
        .entry("owner_org")
        .or_insert_with(|| Value::String(descriptor.organization.clone()));
    let id = package.id().to_string();
    attrs.entry("name").or_insert_with(|| Value::String(id));
    attrs
}

/// Metadata-only creation: the record points at the origin so it is usable
/// before its bytes are uploaded.
fn resource_skeleton(resource: &Resource) -> Attrs {
    let mut skeleton = Attrs::new();
    skeleton.insert("id".to_string(), Value::String(resource.id().to_string()));
    skeleton.insert(
        "package_id".to_string(),
        Value::String(resource.package_id().to_string()),
    );
    skeleton.insert(
        "name".to_string(),
        Value::String(resource.filename().to_string()),
    );
    skeleton.insert(
        "url".to_string(),
        Value::String(resource.origin_url.clone()),
    );
    skeleton
}

fn resource_map(package: &Attrs) -> BTreeMap<String, Attrs> {
    let package_id = package.get("id").cloned().unwrap_or(Value::Null);
    package_resources(package)
        .into_iter()
        .filter_map(|resource| {
            let id = resource.get("id").and_then(Value::as_str)?.to_string();
            let mut resource = resource.clone();
            resource
                .entry("package_id")
                .or_insert_with(|| package_id.clone());
            Some((id, resource))
        })
        .collect()
}
