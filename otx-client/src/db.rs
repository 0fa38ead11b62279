//! Durable session record and the store it is written to

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, ensure};
use otx_core::{
    AccountId, NotaryId, NymId, NymboxDigest, RequestNumber, TransactionNumber,
};
use serde::{Deserialize, Serialize};

pub const SESSION_RECORD_VERSION: u16 = 1;

#[repr(u8)]
#[derive(Clone, Debug)]
pub enum DbKeyPrefix {
    Session = 0x01,
    /// Prefixes between 0xb0..=0xff are reserved for whoever else shares
    /// the store
    ExternalReservedStart = 0xb0,
}

impl std::fmt::Display for DbKeyPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One session exists per (nym, notary) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub nym_id: NymId,
    pub notary_id: NotaryId,
}

impl SessionKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![DbKeyPrefix::Session as u8];
        bytes.extend(serde_json::to_vec(self).expect("Serialization of keys can't fail"));
        bytes
    }
}

/// Durable fields of the session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u16,
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    pub highest_number: TransactionNumber,
    pub issued: BTreeSet<TransactionNumber>,
    pub available: BTreeSet<TransactionNumber>,
    pub tentative: BTreeSet<TransactionNumber>,
    pub acknowledged_requests: BTreeSet<RequestNumber>,
    pub request_counter: RequestNumber,
    pub local_nymbox_digest: NymboxDigest,
    pub remote_nymbox_digest: NymboxDigest,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub accounts: BTreeSet<AccountId>,
}

impl SessionRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            nym_id: self.nym_id.clone(),
            notary_id: self.notary_id.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Serialization of session records can't fail")
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let record: SessionRecord =
            serde_json::from_slice(bytes).context("malformed session record")?;
        ensure!(
            record.version == SESSION_RECORD_VERSION,
            "unsupported session record version {}",
            record.version
        );
        Ok(record)
    }
}

/// Key-value storage for session records
pub trait SessionStore: Debug + Send + Sync {
    fn load(&self, key: &SessionKey) -> anyhow::Result<Option<Vec<u8>>>;

    fn store(&self, key: &SessionKey, value: Vec<u8>) -> anyhow::Result<()>;

    fn remove(&self, key: &SessionKey) -> anyhow::Result<()>;
}

pub type DynSessionStore = Arc<dyn SessionStore>;

#[derive(Debug, Default)]
pub struct MemSessionStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemSessionStore {
    pub fn new() -> MemSessionStore {
        MemSessionStore::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().expect("lock poison").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemSessionStore {
    fn load(&self, key: &SessionKey) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .lock()
            .expect("lock poison")
            .get(&key.to_bytes())
            .cloned())
    }

    fn store(&self, key: &SessionKey, value: Vec<u8>) -> anyhow::Result<()> {
        self.data
            .lock()
            .expect("lock poison")
            .insert(key.to_bytes(), value);
        Ok(())
    }

    fn remove(&self, key: &SessionKey) -> anyhow::Result<()> {
        self.data.lock().expect("lock poison").remove(&key.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            version: SESSION_RECORD_VERSION,
            nym_id: NymId::from("nym"),
            notary_id: NotaryId::from("notary"),
            highest_number: 7,
            issued: BTreeSet::from([5, 6, 7]),
            available: BTreeSet::from([6, 7]),
            tentative: BTreeSet::from([9]),
            acknowledged_requests: BTreeSet::from([1, 2]),
            request_counter: 3,
            local_nymbox_digest: NymboxDigest::hash(b"a"),
            remote_nymbox_digest: NymboxDigest::hash(b"b"),
            registered: true,
            accounts: BTreeSet::new(),
        }
    }

    #[test]
    fn store_load_remove() {
        let store = MemSessionStore::new();
        let record = record();
        store.store(&record.key(), record.encode()).unwrap();

        let loaded = store.load(&record.key()).unwrap().unwrap();
        assert_eq!(SessionRecord::decode(&loaded).unwrap(), record);

        store.remove(&record.key()).unwrap();
        assert!(store.load(&record.key()).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_unknown_versions() {
        let mut record = record();
        record.version = 99;
        assert!(SessionRecord::decode(&record.encode()).is_err());
        assert!(SessionRecord::decode(b"not json").is_err());
    }
}
