use std::io::{self, Read, Write};

use assert_matches::assert_matches;

use bioarchive_ingest::error::SyncError;
use bioarchive_ingest::multihash::{DEFAULT_CHUNK_SIZE, Multihasher, hash_file, hash_reader};

const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// `pattern` repeated `count` times, produced without materializing it.
struct Repeat {
    pattern: &'static [u8],
    remaining: u64,
    offset: usize,
}

impl Repeat {
    fn new(pattern: &'static [u8], count: u64) -> Self {
        Self {
            pattern,
            remaining: pattern.len() as u64 * count,
            offset: 0,
        }
    }
}

impl Read for Repeat {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.remaining > 0 {
            let tail = &self.pattern[self.offset..];
            let take = tail
                .len()
                .min(buf.len() - written)
                .min(self.remaining as usize);
            buf[written..written + take].copy_from_slice(&tail[..take]);
            self.offset = (self.offset + take) % self.pattern.len();
            self.remaining -= take as u64;
            written += take;
        }
        Ok(written)
    }
}

#[test]
fn empty_stream() {
    let hash = hash_reader(io::empty(), &[DEFAULT_CHUNK_SIZE]).unwrap();
    assert_eq!(hash.md5, EMPTY_MD5);
    assert_eq!(
        hash.sha256,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(hash.s3etag(8_388_608), Some(EMPTY_MD5));
}

#[test]
fn single_chunk_etag_is_plain_md5() {
    let hash = hash_reader(Repeat::new(b"hello", 1_048_576), &[DEFAULT_CHUNK_SIZE]).unwrap();
    assert_eq!(hash.md5, "22b0d6ae2d06788edab665b4bc2c1139");
    assert_eq!(hash.s3etag(8_388_608), Some(hash.md5.as_str()));
    assert_eq!(
        hash.sha256,
        "50c5711f72196fb29755b590d503d7772c8e7953b37f30ff5d7baf7445091490"
    );
}

#[test]
fn multi_chunk_etags_carry_part_count() {
    let hash = hash_reader(
        Repeat::new(b"hello", 8_388_608),
        &[8_388_608, 33_554_432],
    )
    .unwrap();
    assert_eq!(hash.md5, "84acd225412524e1706e97655fb068d6");
    assert_eq!(
        hash.s3etag(8_388_608),
        Some("75fb13365cb1a544f03c6558e0fe1497-5")
    );
    assert_eq!(
        hash.s3etag(33_554_432),
        Some("40b449c188f1ac64474a99e07b3f1e65-2")
    );
    assert_eq!(
        hash.sha256,
        "38acde04302e7136c04eddde7b04b03084abd415a5d1e2433b17243153ef8d4a"
    );
}

#[test]
fn chunk_sizes_covering_the_stream_agree_with_md5() {
    let hash = hash_reader(
        Repeat::new(b"hello", 1_048_576),
        &[8_388_608, 16_777_216],
    )
    .unwrap();
    assert_eq!(hash.s3etag(8_388_608), Some(hash.md5.as_str()));
    assert_eq!(hash.s3etag(16_777_216), Some(hash.md5.as_str()));
}

#[test]
fn write_interface_matches_reader() {
    let mut hasher = Multihasher::new(&[64]).unwrap();
    for _ in 0..10 {
        hasher.write_all(b"0123456789abcdef0123").unwrap();
    }
    let written = hasher.finish();

    let read = hash_reader(Repeat::new(b"0123456789abcdef0123", 10), &[64]).unwrap();
    assert_eq!(written, read);
    assert!(written.s3etag(64).unwrap().ends_with("-4"));
}

#[test]
fn to_attrs_names_etag_keys_by_chunk_size() {
    let hash = hash_reader(&b"hello"[..], &[64, 128]).unwrap();
    let attrs = hash.to_attrs();
    assert_eq!(attrs["md5"], "5d41402abc4b2a76b9719d911017c592");
    assert!(attrs.contains_key("sha256"));
    assert!(attrs.contains_key("s3etag_64"));
    assert!(attrs.contains_key("s3etag_128"));
}

#[test]
fn hash_file_reads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"hello").unwrap();
    let hash = hash_file(file.path(), &[DEFAULT_CHUNK_SIZE]).unwrap();
    assert_eq!(hash.md5, "5d41402abc4b2a76b9719d911017c592");
}

#[test]
fn invalid_chunk_size_is_rejected() {
    assert_matches!(
        hash_reader(io::empty(), &[1000]),
        Err(SyncError::InvalidChunkSize(1000))
    );
    assert_matches!(
        hash_reader(io::empty(), &[32]),
        Err(SyncError::InvalidChunkSize(32))
    );
}
