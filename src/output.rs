use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::multihash::MultiHash;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Serialize)]
pub struct HashEntry {
    pub path: String,
    pub size: u64,
    #[serde(flatten)]
    pub hashes: BTreeMap<String, String>,
}

impl HashEntry {
    pub fn new(path: impl Into<String>, size: u64, hash: &MultiHash) -> Self {
        let hashes = hash
            .to_attrs()
            .into_iter()
            .filter_map(|(key, value)| value.as_str().map(|value| (key, value.to_string())))
            .collect();
        Self {
            path: path.into(),
            size,
            hashes,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &SyncReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_hashes(entries: &[HashEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
