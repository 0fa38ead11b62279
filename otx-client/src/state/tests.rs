use std::collections::BTreeSet;
use std::sync::Arc;

use otx_core::message::Command;
use otx_core::signer::Signer as _;
use otx_core::{AccountId, NotaryId, NymId, Signature};
use otx_testing::FakeSigner;

use super::{SessionState, SharedState};
use crate::db::{MemSessionStore, SessionRecord, SessionStore as _};

fn state_with(numbers: &[u64]) -> SessionState {
    let mut state = SessionState::new(NymId::from("alice"), NotaryId::from("notary"), 1);
    for number in numbers {
        assert!(state.numbers.add_tentative(*number));
    }
    assert!(
        state
            .numbers
            .accept_issued_numbers(&numbers.iter().copied().collect())
    );
    state
}

#[test]
fn record_restores_durable_fields() {
    let mut state = state_with(&[5, 6, 7]);
    state.numbers.allocate(crate::NumberPurpose::Transact);
    state.acknowledged_requests.insert(2);
    state.request_counter = 4;
    state.registered = true;
    state.pending_request = Some(Command::GetNymbox);

    let record = state.to_record();
    let restored = SessionState::from_record(SessionRecord::decode(&record.encode()).unwrap(), 1);

    assert_eq!(restored.to_record(), record);
    assert_eq!(restored.numbers.available(), &BTreeSet::from([6, 7]));
    // in-flight delivery state is not durable
    assert!(restored.pending_request.is_none());
}

#[test]
fn next_request_is_signed_and_numbered() {
    let signer = FakeSigner::new("alice");
    let mut state = state_with(&[]);

    let first = state.next_request(Command::GetNymbox, &signer);
    let second = state.next_request(Command::GetNymbox, &signer);
    assert_eq!((first.request_number, second.request_number), (1, 2));
    assert_eq!(state.request_counter, 2);
    assert!(signer.verify("alice", &first.signing_bytes(), &first.signature));
}

#[test]
fn resync_with_own_record_is_a_noop() {
    let mut state = state_with(&[5, 6, 7]);
    let record = state.to_record();

    assert!(state.resync(&record));
    assert_eq!(state.to_record(), record);
}

#[test]
fn resync_refuses_foreign_records() {
    let mut state = state_with(&[5]);
    let mut record = state_with(&[5, 8]).to_record();
    record.nym_id = NymId::from("bob");

    assert!(!state.resync(&record));
    assert_eq!(state.numbers.issued(), &BTreeSet::from([5]));
}

#[test]
fn own_statement_verifies() {
    let signer = FakeSigner::new("alice");
    let state = state_with(&[5, 6, 7]);
    let none = BTreeSet::new();

    let statement = state.statement(&none, &none, &signer);
    assert!(state.verify_statement(&statement, &none, &none, &signer));

    let mut forged = statement.clone();
    forged.signature = Signature(vec![1]);
    assert!(!state.verify_statement(&forged, &none, &none, &signer));
}

#[test]
fn statement_checks_allow_for_pending_changes() {
    let signer = FakeSigner::new("alice");
    let state = state_with(&[5, 6, 7]);
    let none = BTreeSet::new();
    let closing = BTreeSet::from([6]);
    let granted = BTreeSet::from([9]);

    let closed = state.statement(&none, &closing, &signer);
    assert!(!state.verify_statement(&closed, &none, &none, &signer));
    assert!(state.verify_statement(&closed, &closing, &none, &signer));

    let grown = state.statement(&granted, &none, &signer);
    assert!(!state.verify_statement(&grown, &none, &none, &signer));
    assert!(state.verify_statement(&grown, &none, &granted, &signer));

    // an excluded number may not be listed anyway
    let full = state.statement(&none, &none, &signer);
    assert!(!state.verify_statement(&full, &closing, &none, &signer));
}

#[test]
fn updates_are_persisted() {
    let store = Arc::new(MemSessionStore::new());
    let shared = SharedState::new(state_with(&[5]), store.clone(), true);
    let key = shared.read().key();
    assert!(store.load(&key).unwrap().is_none());

    shared.update(|state| state.request_counter = 9);
    let record = SessionRecord::decode(&store.load(&key).unwrap().unwrap()).unwrap();
    assert_eq!(record.request_counter, 9);

    shared.update(SessionState::retire);
    assert!(store.is_empty());
    assert!(shared.read().numbers.issued().is_empty());
    // flushing a retired session does not bring the record back
    shared.flush().unwrap();
    assert!(store.is_empty());
}

#[test]
fn only_durable_changes_are_written() {
    let store = Arc::new(MemSessionStore::new());
    let shared = SharedState::new(state_with(&[5, 6]), store.clone(), true);
    let key = shared.read().key();
    let stored = || SessionRecord::decode(&store.load(&key).unwrap().unwrap()).unwrap();

    shared.update(|state| state.pending_request = Some(Command::GetNymbox));
    assert!(store.is_empty(), "in-flight fields are not durable");
    shared.update(|state| state.acknowledge(3));
    assert_eq!(stored().acknowledged_requests, BTreeSet::from([3]));

    store.remove(&key).unwrap();
    shared.update(|state| state.acknowledge(3));
    assert!(store.is_empty(), "acknowledging twice changes nothing");

    shared.update(|state| state.add_account(AccountId::from("usd-1")));
    assert_eq!(stored().accounts, BTreeSet::from([AccountId::from("usd-1")]));

    shared.update(|state| state.numbers.allocate(crate::NumberPurpose::Transact));
    assert_eq!(stored().available, BTreeSet::from([6]));

    shared.update(|state| state.prune_acknowledged(4));
    assert!(stored().acknowledged_requests.is_empty());
}

#[test]
fn persistence_can_be_disabled() {
    let store = Arc::new(MemSessionStore::new());
    let shared = SharedState::new(state_with(&[5]), store.clone(), false);

    shared.update(|state| state.request_counter = 9);
    shared.flush().unwrap();
    assert!(store.is_empty());
    assert_eq!(shared.inspect(|state| state.request_counter), 9);
}
