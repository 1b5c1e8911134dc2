//! Content digests: `algorithm:hex`, compared as a string.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// A content digest, e.g. `sha256:e3b0c4...`. Compared and hashed as its string form, per
/// the data model: "algorithm name plus hex string; compared as a string."
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// The distinct empty-digest sentinel used for "no layers yet" / unset diffID.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// True if this is the empty sentinel, not a real digest.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a digest from an already-formatted `alg:hex` string without validation.
    ///
    /// Used when a digest arrives pre-formatted from a backend (manifest JSON, daemon
    /// inspect output) and re-parsing would just be a round trip.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Compute the sha256 digest of a readable stream without buffering it whole.
    pub fn sha256_reader(mut r: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("sha256:{}", hex::encode(hasher.finalize()))))
    }

    /// The algorithm prefix, e.g. `sha256`. `None` for the empty sentinel.
    pub fn algorithm(&self) -> Option<&str> {
        self.0.split_once(':').map(|(alg, _)| alg)
    }

    /// The hex payload without the algorithm prefix. `None` for the empty sentinel.
    pub fn hex(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, hex)| hex)
    }

    /// The full `alg:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::Digest;

    #[test]
    fn empty_is_distinct_sentinel() {
        let empty = Digest::empty();
        assert!(empty.is_empty());
        assert_ne!(empty, Digest::sha256(b""));
    }

    #[test]
    fn sha256_known_vector() {
        let d = Digest::sha256(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn reader_matches_slice() {
        let data = b"hello world".repeat(1000);
        let a = Digest::sha256(&data);
        let b = Digest::sha256_reader(&data[..]).expect("reader hash");
        assert_eq!(a, b);
    }

    #[test]
    fn algorithm_and_hex_split() {
        let d = Digest::sha256(b"x");
        assert_eq!(d.algorithm(), Some("sha256"));
        assert!(d.hex().is_some());
        assert_eq!(Digest::empty().algorithm(), None);
    }
}
