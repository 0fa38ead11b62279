use std::fmt::Debug;
use std::sync::Arc;

use crate::{NymId, Signature};

/// Signing identity of the local nym
///
/// Key management lives outside the session; it only needs these three
/// primitives.
pub trait Signer: Debug + Send + Sync {
    /// Identifier of the signing nym
    fn nym_id(&self) -> NymId;

    fn sign(&self, bytes: &[u8]) -> Signature;

    /// Verify `signature` over `bytes` as produced by the identity `signer`
    /// (a nym or a notary)
    fn verify(&self, signer: &str, bytes: &[u8], signature: &Signature) -> bool;
}

pub type DynSigner = Arc<dyn Signer>;
