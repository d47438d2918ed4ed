//! Single-pass MD5, SHA-256 and multipart S3 ETag computation.
//!
//! Object stores identify a multipart upload by the MD5 of the concatenated
//! per-part MD5 digests, suffixed with the part count. Resources carry one
//! `s3etag_<N>` attribute per part size `N` so the archive copy can be
//! matched no matter which part size the uploader used.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::Attrs;
use crate::error::SyncError;

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

const HASH_BLOCK_SIZE: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiHash {
    pub md5: String,
    pub sha256: String,
    pub s3etags: BTreeMap<u64, String>,
}

impl MultiHash {
    pub fn s3etag(&self, chunk_size: u64) -> Option<&str> {
        self.s3etags.get(&chunk_size).map(String::as_str)
    }

    /// Resource attributes: `md5`, `sha256` and one `s3etag_<N>` per size.
    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("md5".to_string(), Value::String(self.md5.clone()));
        attrs.insert("sha256".to_string(), Value::String(self.sha256.clone()));
        for (size, etag) in &self.s3etags {
            attrs.insert(etag_key(*size), Value::String(etag.clone()));
        }
        attrs
    }
}

pub fn etag_key(chunk_size: u64) -> String {
    format!("s3etag_{chunk_size}")
}

pub fn validate_chunk_size(chunk_size: u64) -> Result<u64, SyncError> {
    if chunk_size.is_power_of_two() && chunk_size % HASH_BLOCK_SIZE == 0 {
        Ok(chunk_size)
    } else {
        Err(SyncError::InvalidChunkSize(chunk_size))
    }
}

struct ChunkTracker {
    size: u64,
    filled: u64,
    current: md5::Context,
    digests: Vec<[u8; 16]>,
}

impl ChunkTracker {
    fn new(size: u64) -> Self {
        Self {
            size,
            filled: 0,
            current: md5::Context::new(),
            digests: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (self.size - self.filled) as usize;
            let take = room.min(data.len());
            self.current.consume(&data[..take]);
            self.filled += take as u64;
            data = &data[take..];
            if self.filled == self.size {
                self.close_chunk();
            }
        }
    }

    fn close_chunk(&mut self) {
        let finished = std::mem::replace(&mut self.current, md5::Context::new());
        self.digests.push(finished.finalize().0);
        self.filled = 0;
    }

    fn finish(mut self) -> String {
        if self.filled > 0 {
            self.close_chunk();
        }
        match self.digests.as_slice() {
            [] => format!("{:x}", md5::compute(b"")),
            [single] => hex::encode(single),
            many => {
                let mut outer = md5::Context::new();
                for digest in many {
                    outer.consume(digest);
                }
                format!("{:x}-{}", outer.finalize(), many.len())
            }
        }
    }
}

/// Incremental hasher; feed it with [`Multihasher::update`] or through
/// `io::Write`.
pub struct Multihasher {
    md5: md5::Context,
    sha256: Sha256,
    chunks: Vec<ChunkTracker>,
}

impl Multihasher {
    pub fn new(chunk_sizes: &[u64]) -> Result<Self, SyncError> {
        let mut sizes = chunk_sizes
            .iter()
            .map(|size| validate_chunk_size(*size))
            .collect::<Result<Vec<_>, _>>()?;
        sizes.sort_unstable();
        sizes.dedup();
        Ok(Self {
            md5: md5::Context::new(),
            sha256: Sha256::new(),
            chunks: sizes.into_iter().map(ChunkTracker::new).collect(),
        })
    }

    /// Physical read size for a single pass: the smallest chunk size.
    pub fn block_size(&self) -> u64 {
        self.chunks
            .first()
            .map(|chunk| chunk.size)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.consume(data);
        self.sha256.update(data);
        for chunk in &mut self.chunks {
            chunk.update(data);
        }
    }

    pub fn finish(self) -> MultiHash {
        MultiHash {
            md5: format!("{:x}", self.md5.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            s3etags: self
                .chunks
                .into_iter()
                .map(|chunk| (chunk.size, chunk.finish()))
                .collect(),
        }
    }
}

impl Write for Multihasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn hash_reader<R: Read>(mut reader: R, chunk_sizes: &[u64]) -> Result<MultiHash, SyncError> {
    let mut hasher = Multihasher::new(chunk_sizes)?;
    let mut block = vec![0u8; hasher.block_size() as usize];
    loop {
        let filled = fill_block(&mut reader, &mut block)?;
        if filled == 0 {
            break;
        }
        hasher.update(&block[..filled]);
        if filled < block.len() {
            break;
        }
    }
    Ok(hasher.finish())
}

pub fn hash_file(path: &Path, chunk_sizes: &[u64]) -> Result<MultiHash, SyncError> {
    let file = File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    hash_reader(file, chunk_sizes)
}

fn fill_block<R: Read>(reader: &mut R, block: &mut [u8]) -> Result<usize, SyncError> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SyncError::Filesystem(err.to_string())),
        }
    }
    Ok(filled)
}
