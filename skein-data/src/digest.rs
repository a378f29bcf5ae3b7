//! Content digests and structural fingerprints.
//!
//! A `Digest` names the bytes of a blob: hash function, hex digest and size.
//! A `Fingerprint` names the shape of a structure (an action key, an input
//! set, a configuration) and carries no size. Both are produced through
//! `ContentHasher`, which length-prefixes every field so that adjacent inputs
//! cannot collide by concatenation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The hash function every digest in one build is computed with.
///
/// Carried inside `Digest` so that cache entries written under a different
/// configuration are never mistaken for current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashFunction {
    Sha256,
}

impl Default for HashFunction {
    fn default() -> HashFunction {
        HashFunction::Sha256
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashFunction::Sha256 => f.write_str("sha256"),
        }
    }
}

impl FromStr for HashFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<HashFunction, String> {
        match s {
            "sha256" | "SHA256" | "sha-256" => Ok(HashFunction::Sha256),
            other => Err(format!("unknown hash function `{}`", other)),
        }
    }
}

/// A `{hash_function, hex_digest, size}` triple naming the content of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub function: HashFunction,
    pub hex: String,
    pub size: u64,
}

impl Digest {
    /// Digests a byte slice in one shot.
    pub fn of_bytes(function: HashFunction, bytes: &[u8]) -> Digest {
        match function {
            HashFunction::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                Digest { function, hex: to_hex(&hasher.finalize()), size: bytes.len() as u64 }
            }
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.function, self.hex, self.size)
    }
}

/// A structural hash with no associated byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher with length-prefixed field framing.
pub struct ContentHasher {
    function: HashFunction,
    inner: Sha256,
    total: u64,
}

impl ContentHasher {
    pub fn new(function: HashFunction) -> ContentHasher {
        ContentHasher { function, inner: Sha256::new(), total: 0 }
    }

    /// Feeds one framed field. The length prefix keeps `"ab" + "c"` distinct
    /// from `"a" + "bc"`.
    pub fn input_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self.total += bytes.len() as u64;
        self
    }

    pub fn input_str(&mut self, s: &str) -> &mut Self {
        self.input_bytes(s.as_bytes())
    }

    pub fn input_u64(&mut self, v: u64) -> &mut Self {
        self.input_bytes(&v.to_le_bytes())
    }

    /// Feeds raw, unframed bytes. Used when digesting file contents where the
    /// byte stream itself is the field.
    pub fn input_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self.total += bytes.len() as u64;
        self
    }

    pub fn finish_fingerprint(self) -> Fingerprint {
        Fingerprint(to_hex(&self.inner.finalize()))
    }

    /// Finishes as a content digest; `size` is the number of raw bytes fed.
    pub fn finish_digest(self) -> Digest {
        Digest { function: self.function, hex: to_hex(&self.inner.finalize()), size: self.total }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
