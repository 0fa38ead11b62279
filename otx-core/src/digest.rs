use std::fmt;
use std::str::FromStr;

use bitcoin_hashes::{Hash as _, sha256};
use serde::{Deserialize, Serialize};

/// SHA-256 digest of a nymbox's entry headers
///
/// The all-zero digest means "never computed" and never matches a digest
/// asserted by a notary.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NymboxDigest(#[serde(with = "hex::serde")] [u8; 32]);

impl NymboxDigest {
    pub fn hash(bytes: &[u8]) -> Self {
        Self(sha256::Hash::hash(bytes).to_byte_array())
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NymboxDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NymboxDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NymboxDigest({self})")
    }
}

impl FromStr for NymboxDigest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parses_back() {
        let digest = NymboxDigest::hash(b"nymbox");
        assert!(!digest.is_unset());
        assert_eq!(digest.to_string().parse::<NymboxDigest>().unwrap(), digest);
    }

    #[test]
    fn default_is_unset() {
        assert!(NymboxDigest::default().is_unset());
        assert_ne!(NymboxDigest::default(), NymboxDigest::hash(b""));
    }
}
