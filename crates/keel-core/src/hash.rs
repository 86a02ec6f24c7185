//! Stable string hashing.
//!
//! Resource identifiers must hash identically across runs and platforms, so this uses
//! FNV-1a instead of the randomly seeded hasher behind [`crate::alloc::HashMap`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a hash of a byte slice.
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// A string together with its precomputed stable hash.
///
/// Equality and hashing only look at the hash, which makes lookups cheap. Cloning is
/// cheap as well since the text is shared.
#[derive(Clone)]
pub struct HashedString {
    hash: u64,
    text: Arc<str>,
}

impl HashedString {
    /// Hash `text` and keep a shared copy of it.
    pub fn new(text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        Self {
            hash: fnv1a_64(text.as_bytes()),
            text: Arc::from(text),
        }
    }

    /// The stable 64-bit hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The original text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for HashedString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for HashedString {}

impl Hash for HashedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for HashedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{:016x}", self.text, self.hash)
    }
}

impl fmt::Display for HashedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for HashedString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for HashedString {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}
