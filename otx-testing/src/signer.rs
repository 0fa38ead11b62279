use bitcoin_hashes::{Hash as _, sha256};
use otx_core::signer::Signer;
use otx_core::{NymId, Signature};

/// Deterministic stand-in for a key pair
///
/// A "signature" is the hash of the signer id and the signed bytes, so any
/// `FakeSigner` can verify what any other produced, and tampering with
/// either the bytes or the claimed signer is detected.
#[derive(Debug, Clone)]
pub struct FakeSigner {
    id: String,
}

impl FakeSigner {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signature_for(signer: &str, bytes: &[u8]) -> Signature {
        let mut preimage = Vec::with_capacity(8 + signer.len() + bytes.len());
        preimage.extend((signer.len() as u64).to_be_bytes());
        preimage.extend(signer.as_bytes());
        preimage.extend(bytes);
        Signature(sha256::Hash::hash(&preimage).to_byte_array().to_vec())
    }
}

impl Signer for FakeSigner {
    fn nym_id(&self) -> NymId {
        NymId::new(self.id.clone())
    }

    fn sign(&self, bytes: &[u8]) -> Signature {
        Self::signature_for(&self.id, bytes)
    }

    fn verify(&self, signer: &str, bytes: &[u8], signature: &Signature) -> bool {
        *signature == Self::signature_for(signer, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_only_matching_signer_and_bytes() {
        let alice = FakeSigner::new("alice");
        let notary = FakeSigner::new("notary");
        let sig = notary.sign(b"reply");

        assert!(alice.verify("notary", b"reply", &sig));
        assert!(!alice.verify("alice", b"reply", &sig));
        assert!(!alice.verify("notary", b"replay", &sig));
    }
}
