//! Content hashing for state snapshot identifiers.
//!
//! - `ObjectHash`: a truncated 20-character hash used as a snapshot id
//! - `Hashable`: derive an `ObjectHash` from any serializable value
//! - `hash_bytes()`: full SHA-256 of arbitrary bytes

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the truncated hex digest used for ids.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a unique object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized value,
/// lowercase hex, e.g. `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types that can be content-addressed by their JSON form.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let full = hash_bytes(serialized.as_bytes());
    Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// Hash arbitrary bytes. Returns the full 64-character hex digest.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Serialize)]
  struct Sample {
    name: &'static str,
    count: u32,
  }

  impl Hashable for Sample {}

  #[test]
  fn hash_is_truncated_and_deterministic() {
    let a = Sample { name: "db", count: 1 }.compute_hash().unwrap();
    let b = Sample { name: "db", count: 1 }.compute_hash().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.0.len(), OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn hash_changes_with_content() {
    let a = Sample { name: "db", count: 1 }.compute_hash().unwrap();
    let b = Sample { name: "db", count: 2 }.compute_hash().unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn hash_bytes_is_full_digest() {
    let digest = hash_bytes(b"hello world");
    assert_eq!(digest.len(), 64);
    assert!(digest.starts_with("b94d27b9934d3e08"));
  }
}
