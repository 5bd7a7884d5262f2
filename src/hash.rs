// src/hash.rs

//! Hashing for fingerprints, cache keys and content addresses
//!
//! | Use Case | Algorithm |
//! |----------|-----------|
//! | Project fingerprint, layer cache keys | FNV-1a (64-bit) |
//! | Pack content addresses, manifest file table | SHA-256 |
//! | Unchanged-file detection during transfers | XXH128 |

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit cryptographic hash)
    #[default]
    Sha256,
    /// XXH128 (128-bit non-cryptographic hash)
    Xxh128,
    /// FNV-1a (64-bit non-cryptographic hash)
    ///
    /// Stable across platforms and releases, used wherever a short key is
    /// persisted to disk and compared on a later run.
    Fnv1a,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Xxh128 => 16,
            Self::Fnv1a => 8,
        }
    }

    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
            Self::Fnv1a => "fnv1a",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            "fnv1a" | "fnv-1a" | "fnv" => Ok(Self::Fnv1a),
            _ => Err(format!("unknown hash algorithm: {s}")),
        }
    }
}

/// A hash value with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    /// The hash value as a lowercase hex string
    pub value: String,
}

impl Hash {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Incremental 64-bit FNV-1a state
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        for byte in data {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Feed a string followed by a separator byte so that adjacent fields
    /// cannot run together ("ab","c" != "a","bc").
    pub fn update_field(&mut self, field: &str) {
        self.update(field.as_bytes());
        self.update(&[0]);
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

/// FNV-1a over a byte slice
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut state = Fnv1a::new();
    state.update(data);
    state.finish()
}

/// Hasher that can compute hashes using any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Xxh128(Vec<u8>), // XXH3 doesn't have incremental API, buffer data
    Fnv1a(Fnv1a),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Vec::new()),
            HashAlgorithm::Fnv1a => HasherState::Fnv1a(Fnv1a::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(buffer) => buffer.extend_from_slice(data),
            HasherState::Fnv1a(state) => state.update(data),
        }
    }

    pub fn finalize(self) -> Hash {
        let value = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Xxh128(buffer) => format!("{:032x}", xxh3_128(&buffer)),
            HasherState::Fnv1a(state) => format!("{:016x}", state.finish()),
        };
        Hash {
            algorithm: self.algorithm,
            value,
        }
    }
}

/// Compute hash of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute hash of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<Hash> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Hash a file's content without loading it fully into memory
pub fn hash_file(algorithm: HashAlgorithm, path: &std::path::Path) -> io::Result<Hash> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(algorithm, &mut file)
}

#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data).value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        // Reference vectors for 64-bit FNV-1a
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_fnv1a_incremental_matches_oneshot() {
        let mut state = Fnv1a::new();
        state.update(b"foo");
        state.update(b"bar");
        assert_eq!(state.finish(), fnv1a_64(b"foobar"));
    }

    #[test]
    fn test_update_field_separates_values() {
        let mut a = Fnv1a::new();
        a.update_field("ab");
        a.update_field("c");
        let mut b = Fnv1a::new();
        b.update_field("a");
        b.update_field("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_sha256_hash() {
        let hash = hash_bytes(HashAlgorithm::Sha256, b"Hello, World!");
        assert_eq!(
            hash.value,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_output_lengths() {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Xxh128, HashAlgorithm::Fnv1a] {
            assert_eq!(hash_bytes(algo, b"data").value.len(), algo.hex_len());
        }
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("FNV-1a".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Fnv1a);
        assert!("md4".parse::<HashAlgorithm>().is_err());
    }
}
