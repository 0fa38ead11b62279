use std::collections::BTreeSet;

use otx_logging::LOG_CORE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{NotaryId, NymId, Signature, TransactionNumber, canonical_bytes};

/// Attested snapshot of the numbers a nym is responsible for at a notary
///
/// Statements travel inside balance agreements and nymbox accepts, letting
/// client and notary cross-check their view of the issued set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatement {
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    pub issued: BTreeSet<TransactionNumber>,
    pub available: BTreeSet<TransactionNumber>,
    #[serde(default)]
    pub signature: Signature,
}

#[derive(Serialize)]
struct StatementSigningView<'a> {
    nym_id: &'a NymId,
    notary_id: &'a NotaryId,
    issued: &'a BTreeSet<TransactionNumber>,
    available: &'a BTreeSet<TransactionNumber>,
}

impl TransactionStatement {
    pub fn new(
        nym_id: NymId,
        notary_id: NotaryId,
        issued: BTreeSet<TransactionNumber>,
        available: BTreeSet<TransactionNumber>,
    ) -> Self {
        Self {
            nym_id,
            notary_id,
            issued,
            available,
            signature: Signature::default(),
        }
    }

    /// Bytes covered by [`Self::signature`]
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&StatementSigningView {
            nym_id: &self.nym_id,
            notary_id: &self.notary_id,
            issued: &self.issued,
            available: &self.available,
        })
    }

    /// Whether `newer` may follow `self`
    ///
    /// Both must describe the same nym at the same notary, and every number
    /// issued in `newer` must either have been issued in `self` or be listed
    /// in `added`. Numbers may disappear between statements (they were
    /// closed), they may never appear unannounced.
    pub fn verify_successor(
        &self,
        newer: &TransactionStatement,
        added: &BTreeSet<TransactionNumber>,
    ) -> bool {
        if self.nym_id != newer.nym_id
            || self.notary_id != newer.notary_id
            || !newer.available.is_subset(&newer.issued)
        {
            return false;
        }
        let unannounced = newer
            .issued
            .iter()
            .copied()
            .find(|number| !self.issued.contains(number) && !added.contains(number));
        if let Some(number) = unannounced {
            debug!(target: LOG_CORE, number, "Statement lists a number that was never announced");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(issued: &[u64]) -> TransactionStatement {
        TransactionStatement::new(
            NymId::from("nym"),
            NotaryId::from("notary"),
            issued.iter().copied().collect(),
            issued.iter().copied().collect(),
        )
    }

    #[test]
    fn successor_may_drop_numbers() {
        assert!(statement(&[1, 2, 3]).verify_successor(&statement(&[1, 3]), &BTreeSet::new()));
    }

    #[test]
    fn successor_may_not_add_silently() {
        let old = statement(&[1, 2]);
        let new = statement(&[1, 2, 9]);
        assert!(!old.verify_successor(&new, &BTreeSet::new()));
        assert!(old.verify_successor(&new, &BTreeSet::from([9])));
    }

    #[test]
    fn signature_is_not_signed_over() {
        let mut signed = statement(&[4]);
        let bytes = signed.signing_bytes();
        signed.signature = Signature(vec![1, 2, 3]);
        assert_eq!(signed.signing_bytes(), bytes);
    }
}
