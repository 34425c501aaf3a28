//! Stable opaque subject token.
//!
//! Created only when no existing mapping can be found; never reassigned,
//! never destroyed.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const UNIVERSAL_ID_PREFIX: &str = "sf_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniversalId(String);

impl UniversalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `sf_` + 16 hex chars drawn from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        let mut s = String::with_capacity(UNIVERSAL_ID_PREFIX.len() + 16);
        s.push_str(UNIVERSAL_ID_PREFIX);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniversalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UniversalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = UniversalId::generate();
        assert!(id.as_str().starts_with("sf_"));
        assert_eq!(id.as_str().len(), 19);
        assert!(id.as_str()[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_unique() {
        let a = UniversalId::generate();
        let b = UniversalId::generate();
        assert_ne!(a, b);
    }
}
