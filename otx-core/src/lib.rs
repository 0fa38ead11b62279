#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # Core notary protocol types
//!
//! Value types exchanged between a client session and a notary: requests
//! and replies, nymbox entries and their box receipts, transaction
//! statements. Also home of the collaborator contracts the client session is
//! written against ([`transport::Transport`], [`signer::Signer`],
//! [`workflow::Workflow`]) and the task group used to run deliveries.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod digest;
pub mod envs;
pub mod message;
pub mod nymbox;
pub mod signer;
pub mod statement;
pub mod task;
pub mod transport;
pub mod workflow;

pub use digest::NymboxDigest;

/// A notary-issued transaction number
///
/// Zero is never issued and is used as the "absent" sentinel.
pub type TransactionNumber = u64;

/// Sequence number of a request sent by a client to a notary
pub type RequestNumber = u64;

/// Identifier of one entry in a nymbox
pub type ItemId = u64;

macro_rules! define_identifier {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

define_identifier!(
    /// Identity ("nym") of a client as known to a notary
    NymId
);
define_identifier!(
    /// Identity of a notary server
    NotaryId
);
define_identifier!(
    /// Asset account registered by a nym at a notary
    AccountId
);

/// Opaque signature bytes produced by a [`signer::Signer`]
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex::serde")] pub Vec<u8>);

impl Signature {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// Canonical encoding used for hashing and signing
///
/// All protocol types are built from ordered collections, so the JSON
/// encoding is deterministic.
pub(crate) fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("Serialization of protocol types can't fail")
}
