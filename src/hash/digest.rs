//! Streaming digests over one or more algorithms
//!
//! Backends declare which algorithms they can produce server-side; when a
//! transfer needs a digest the source cannot supply, the pipeline wraps
//! the source reader in a [`MultiHasher`] tee so every algorithm is fed in
//! a single pass.

use crate::error::{Result, SyncError};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::str::FromStr;

/// Buffer size for streaming hash computation
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Supported digest algorithms, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    /// MD5 - the lingua franca of object stores
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlg {
    /// All supported algorithms, preference order first.
    pub const ALL: [HashAlg; 3] = [HashAlg::Md5, HashAlg::Sha1, HashAlg::Sha256];

    /// Digest length in bytes
    pub fn output_size(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashAlg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlg {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(SyncError::config(format!("unknown hash algorithm: {other}"))),
        }
    }
}

/// Set of algorithms a backend can produce server-side
pub type HashAlgSet = BTreeSet<HashAlg>;

/// Digests keyed by algorithm, hex lowercase
pub type HashSums = BTreeMap<HashAlg, String>;

/// Build a [`HashAlgSet`] from a slice
pub fn alg_set(algs: &[HashAlg]) -> HashAlgSet {
    algs.iter().copied().collect()
}

/// Pick the preferred algorithm both sides support.
///
/// A hash comparison between source and destination is only valid when
/// such a common algorithm exists; callers fall back to size+mtime and
/// mark the check as weak otherwise.
pub fn common_alg(a: &HashAlgSet, b: &HashAlgSet) -> Option<HashAlg> {
    HashAlg::ALL.into_iter().find(|alg| a.contains(alg) && b.contains(alg))
}

/// Unified hasher over all supported algorithms
pub enum Hasher {
    /// MD5 state
    Md5(Md5),
    /// SHA-1 state
    Sha1(Sha1),
    /// SHA-256 state
    Sha256(Sha256),
}

impl Hasher {
    /// Create a new hasher for the given algorithm
    pub fn new(alg: HashAlg) -> Self {
        match alg {
            HashAlg::Md5 => Self::Md5(Md5::new()),
            HashAlg::Sha1 => Self::Sha1(Sha1::new()),
            HashAlg::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    /// Get the algorithm this hasher uses
    pub fn algorithm(&self) -> HashAlg {
        match self {
            Self::Md5(_) => HashAlg::Md5,
            Self::Sha1(_) => HashAlg::Sha1,
            Self::Sha256(_) => HashAlg::Sha256,
        }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finalize and get the digest as a lowercase hex string
    pub fn finalize(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hasher that feeds every written block to a set of algorithms at once
pub struct MultiHasher {
    hashers: Vec<Hasher>,
    bytes: u64,
}

impl MultiHasher {
    /// Create a multi-hasher for the given algorithm set
    pub fn new(algs: &HashAlgSet) -> Self {
        Self {
            hashers: algs.iter().map(|&alg| Hasher::new(alg)).collect(),
            bytes: 0,
        }
    }

    /// Process a block of data
    pub fn update(&mut self, data: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(data);
        }
        self.bytes += data.len() as u64;
    }

    /// Bytes processed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalize every algorithm
    pub fn finalize(self) -> HashSums {
        self.hashers
            .into_iter()
            .map(|h| (h.algorithm(), h.finalize()))
            .collect()
    }
}

/// Reader tee that hashes everything passing through it
pub struct HashingReader<R> {
    inner: R,
    hasher: MultiHasher,
}

impl<R: Read> HashingReader<R> {
    /// Wrap a reader, hashing with the given algorithm set
    pub fn new(inner: R, algs: &HashAlgSet) -> Self {
        Self {
            inner,
            hasher: MultiHasher::new(algs),
        }
    }

    /// Bytes read through the tee so far
    pub fn bytes(&self) -> u64 {
        self.hasher.bytes()
    }

    /// Consume the tee, returning the digests and the byte count
    pub fn finalize(self) -> (HashSums, u64) {
        let bytes = self.hasher.bytes();
        (self.hasher.finalize(), bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Hash an entire stream with a set of algorithms, returning digests and size
pub fn hash_stream(reader: &mut dyn Read, algs: &HashAlgSet) -> Result<(HashSums, u64)> {
    let mut hasher = MultiHasher::new(algs);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| SyncError::transient(format!("read during hash: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let bytes = hasher.bytes();
    Ok((hasher.finalize(), bytes))
}

/// Hash a byte slice with a single algorithm
pub fn hash_bytes(data: &[u8], alg: HashAlg) -> String {
    let mut hasher = Hasher::new(alg);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        // Reference vectors for the empty string
        assert_eq!(hash_bytes(b"", HashAlg::Md5), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            hash_bytes(b"", HashAlg::Sha1),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            hash_bytes(b"abc", HashAlg::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_multi_hasher_single_pass() {
        let algs = alg_set(&HashAlg::ALL);
        let mut multi = MultiHasher::new(&algs);
        multi.update(b"Hello, ");
        multi.update(b"World!");
        let sums = multi.finalize();

        for alg in HashAlg::ALL {
            assert_eq!(sums[&alg], hash_bytes(b"Hello, World!", alg));
        }
    }

    #[test]
    fn test_hashing_reader_tee() {
        let data = b"some file content".to_vec();
        let algs = alg_set(&[HashAlg::Md5]);
        let mut tee = HashingReader::new(std::io::Cursor::new(data.clone()), &algs);

        let mut sink = Vec::new();
        std::io::copy(&mut tee, &mut sink).unwrap();
        assert_eq!(sink, data);

        let (sums, bytes) = tee.finalize();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(sums[&HashAlg::Md5], hash_bytes(&data, HashAlg::Md5));
    }

    #[test]
    fn test_common_alg_preference() {
        let a = alg_set(&[HashAlg::Sha1, HashAlg::Md5]);
        let b = alg_set(&[HashAlg::Md5, HashAlg::Sha256]);
        assert_eq!(common_alg(&a, &b), Some(HashAlg::Md5));

        let c = alg_set(&[HashAlg::Sha256]);
        assert_eq!(common_alg(&a, &c), None);
        assert_eq!(common_alg(&b, &c), Some(HashAlg::Sha256));
        assert_eq!(common_alg(&c, &alg_set(&[])), None);
    }

    #[test]
    fn test_hash_stream() {
        let data = vec![0xA5u8; 3 * 1024 * 1024 + 17];
        let algs = alg_set(&[HashAlg::Sha256]);
        let (sums, size) = hash_stream(&mut std::io::Cursor::new(&data), &algs).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(sums[&HashAlg::Sha256], hash_bytes(&data, HashAlg::Sha256));
    }

    #[test]
    fn test_alg_parse() {
        assert_eq!("md5".parse::<HashAlg>().unwrap(), HashAlg::Md5);
        assert_eq!("SHA-1".parse::<HashAlg>().unwrap(), HashAlg::Sha1);
        assert!("crc32".parse::<HashAlg>().is_err());
    }
}
