use assert_matches::assert_matches;
use serde_json::json;

use bioarchive_ingest::domain::{
    LinkageTuple, Package, filename_from_url, make_package_id, ticket_segment,
};
use bioarchive_ingest::error::SyncError;

fn package(value: serde_json::Value) -> Package {
    match value {
        serde_json::Value::Object(map) => Package::new(map),
        _ => unreachable!(),
    }
}

#[test]
fn linkage_reads_keys_in_descriptor_order() {
    let package = package(json!({ "id": "p1", "flowcell": "HXYZ", "sample_id": 1234 }));
    let keys = vec!["sample_id".to_string(), "flowcell".to_string()];
    let linkage = package.linkage(&keys).unwrap();
    assert_eq!(linkage, LinkageTuple::new(["1234", "HXYZ"]));
    assert_eq!(linkage.to_string(), "(1234, HXYZ)");
}

#[test]
fn linkage_requires_every_key() {
    let package = package(json!({ "id": "p1" }));
    let err = package.linkage(&["sample_id".to_string()]).unwrap_err();
    assert_matches!(err, SyncError::MissingLinkageKey { key, .. } if key == "sample_id");
}

#[test]
fn name_falls_back_to_id() {
    assert_eq!(package(json!({ "id": "p1" })).name(), "p1");
    assert_eq!(package(json!({ "id": "p1", "name": "soil" })).name(), "soil");
}

#[test]
fn package_id_depends_only_on_type_and_linkage() {
    let first = make_package_id("amdb-genomics", &LinkageTuple::new(["S1", "HXYZ"]));
    let second = make_package_id("amdb-genomics", &LinkageTuple::new(["S1", "HXYZ"]));
    let other = make_package_id("amdb-genomics", &LinkageTuple::new(["S1", "HXYW"]));
    assert_eq!(first, second);
    assert_ne!(first, other);
    assert!(
        first
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    );
}

#[test]
fn url_segments_ignore_query_strings() {
    let url = "https://downloads.example.org/amd/T42/reads_R1.fastq.gz?token=abc";
    assert_eq!(filename_from_url(url), "reads_R1.fastq.gz");
    assert_eq!(ticket_segment(url), "T42");
}
