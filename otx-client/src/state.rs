use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use otx_core::message::{Command, Reply, Request};
use otx_core::nymbox::{BoxReceipt, Nymbox};
use otx_core::signer::Signer;
use otx_core::statement::TransactionStatement;
use otx_core::{
    AccountId, ItemId, NotaryId, NymId, NymboxDigest, RequestNumber, Signature,
    TransactionNumber,
};
use otx_logging::{LOG_CLIENT_DB, LOG_CLIENT_SESSION};
use tracing::{debug, trace, warn};

use crate::db::{DynSessionStore, SESSION_RECORD_VERSION, SessionKey, SessionRecord};
use crate::delivery::{DeliveryState, ReplyStatus};
use crate::ledger::NumberLedger;
use crate::reconcile::StagedAccept;

/// Everything a session knows about its nym at one notary
#[derive(Debug)]
pub struct SessionState {
    pub(crate) nym_id: NymId,
    pub(crate) notary_id: NotaryId,
    pub(crate) numbers: NumberLedger,
    /// Requests whose replies were fully processed
    pub(crate) acknowledged_requests: BTreeSet<RequestNumber>,
    /// Last request number used
    pub(crate) request_counter: RequestNumber,
    pub(crate) local_nymbox_digest: NymboxDigest,
    pub(crate) remote_nymbox_digest: NymboxDigest,
    pub(crate) delivery_state: DeliveryState,
    pub(crate) last_status: ReplyStatus,
    /// Caller payload of the running delivery
    pub(crate) pending_request: Option<Command>,
    /// Request number the payload was last transmitted under
    pub(crate) awaiting_reply: Option<RequestNumber>,
    /// Reply to the payload, held while the nymbox is brought up to date
    pub(crate) pending_reply: Option<Reply>,
    pub(crate) failure_count: u32,
    pub(crate) registered: bool,
    /// Set once the nym unregistered; the record is removed on next persist
    pub(crate) retired: bool,
    pub(crate) accounts: BTreeSet<AccountId>,
    /// Last downloaded nymbox, minus the entries accepted since
    pub(crate) nymbox: Option<Nymbox>,
    /// Request the nymbox was downloaded with
    pub(crate) nymbox_request: Option<RequestNumber>,
    pub(crate) box_receipts: BTreeMap<ItemId, BoxReceipt>,
    pub(crate) pending_accept: Option<StagedAccept>,
    /// Bumped when `acknowledged_requests` or `accounts` change
    revision: u64,
}

/// Changes whenever the durable record of a [`SessionState`] does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DurableMark {
    numbers: u64,
    revision: u64,
    request_counter: RequestNumber,
    local_nymbox_digest: NymboxDigest,
    remote_nymbox_digest: NymboxDigest,
    registered: bool,
}

impl SessionState {
    pub fn new(nym_id: NymId, notary_id: NotaryId, number_reserve: usize) -> Self {
        Self {
            nym_id,
            notary_id,
            numbers: NumberLedger::new(number_reserve),
            acknowledged_requests: BTreeSet::new(),
            request_counter: 0,
            local_nymbox_digest: NymboxDigest::default(),
            remote_nymbox_digest: NymboxDigest::default(),
            delivery_state: DeliveryState::Idle,
            last_status: ReplyStatus::NotSent,
            pending_request: None,
            awaiting_reply: None,
            pending_reply: None,
            failure_count: 0,
            registered: false,
            retired: false,
            accounts: BTreeSet::new(),
            nymbox: None,
            nymbox_request: None,
            box_receipts: BTreeMap::new(),
            pending_accept: None,
            revision: 0,
        }
    }

    fn mark(&self) -> DurableMark {
        DurableMark {
            numbers: self.numbers.revision(),
            revision: self.revision,
            request_counter: self.request_counter,
            local_nymbox_digest: self.local_nymbox_digest,
            remote_nymbox_digest: self.remote_nymbox_digest,
            registered: self.registered,
        }
    }

    /// Record that the reply to `request_number` was processed
    ///
    /// Returns `false` if it already was.
    pub(crate) fn acknowledge(&mut self, request_number: RequestNumber) -> bool {
        let new = self.acknowledged_requests.insert(request_number);
        if new {
            self.revision += 1;
        }
        new
    }

    /// Forget acknowledged requests below `floor`
    ///
    /// Only safe once no reply notice for any of them can show up again.
    pub(crate) fn prune_acknowledged(&mut self, floor: RequestNumber) -> usize {
        let kept = self.acknowledged_requests.split_off(&floor);
        let pruned = self.acknowledged_requests.len();
        self.acknowledged_requests = kept;
        if pruned > 0 {
            self.revision += 1;
            trace!(target: LOG_CLIENT_SESSION, floor, pruned, "Pruned acknowledged requests");
        }
        pruned
    }

    pub(crate) fn add_account(&mut self, account: AccountId) {
        if self.accounts.insert(account) {
            self.revision += 1;
        }
    }

    pub(crate) fn remove_account(&mut self, account: &AccountId) {
        if self.accounts.remove(account) {
            self.revision += 1;
        }
    }

    pub fn from_record(record: SessionRecord, number_reserve: usize) -> Self {
        let mut state = Self::new(record.nym_id, record.notary_id, number_reserve);
        state.numbers = NumberLedger::from_parts(
            record.highest_number,
            record.issued,
            record.available,
            record.tentative,
            number_reserve,
        );
        state.acknowledged_requests = record.acknowledged_requests;
        state.request_counter = record.request_counter;
        state.local_nymbox_digest = record.local_nymbox_digest;
        state.remote_nymbox_digest = record.remote_nymbox_digest;
        state.registered = record.registered;
        state.accounts = record.accounts;
        state
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            version: SESSION_RECORD_VERSION,
            nym_id: self.nym_id.clone(),
            notary_id: self.notary_id.clone(),
            highest_number: self.numbers.highest(),
            issued: self.numbers.issued().clone(),
            available: self.numbers.available().clone(),
            tentative: self.numbers.tentative().clone(),
            acknowledged_requests: self.acknowledged_requests.clone(),
            request_counter: self.request_counter,
            local_nymbox_digest: self.local_nymbox_digest,
            remote_nymbox_digest: self.remote_nymbox_digest,
            registered: self.registered,
            accounts: self.accounts.clone(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            nym_id: self.nym_id.clone(),
            notary_id: self.notary_id.clone(),
        }
    }

    /// Build and sign the next request, consuming a request number
    pub(crate) fn next_request(&mut self, command: Command, signer: &dyn Signer) -> Request {
        self.request_counter += 1;
        let mut request = Request {
            request_number: self.request_counter,
            nym_id: self.nym_id.clone(),
            notary_id: self.notary_id.clone(),
            nymbox_hash: self.local_nymbox_digest,
            command,
            signature: Signature::default(),
        };
        request.signature = signer.sign(&request.signing_bytes());
        trace!(
            target: LOG_CLIENT_SESSION,
            request_number = request.request_number,
            kind = %request.kind(),
            "Built request"
        );
        request
    }

    /// Signed statement of the numbers held once `adding` were granted and
    /// `without` closed
    pub(crate) fn statement(
        &self,
        adding: &BTreeSet<TransactionNumber>,
        without: &BTreeSet<TransactionNumber>,
        signer: &dyn Signer,
    ) -> TransactionStatement {
        let (issued, available) = self.numbers.statement_sets(adding, without);
        let mut statement =
            TransactionStatement::new(self.nym_id.clone(), self.notary_id.clone(), issued, available);
        statement.signature = signer.sign(&statement.signing_bytes());
        statement
    }

    /// Check a statement against the local issued set
    ///
    /// Every issued number not in `excluded` has to be listed, and the
    /// statement may list nothing beyond the issued numbers and `included`.
    pub(crate) fn verify_statement(
        &self,
        statement: &TransactionStatement,
        excluded: &BTreeSet<TransactionNumber>,
        included: &BTreeSet<TransactionNumber>,
        signer: &dyn Signer,
    ) -> bool {
        if statement.nym_id != self.nym_id || statement.notary_id != self.notary_id {
            debug!(target: LOG_CLIENT_SESSION, "Statement is for a different session");
            return false;
        }
        if !signer.verify(
            statement.nym_id.as_str(),
            &statement.signing_bytes(),
            &statement.signature,
        ) {
            debug!(target: LOG_CLIENT_SESSION, "Statement signature does not verify");
            return false;
        }
        if !statement.available.is_subset(&statement.issued) {
            return false;
        }

        let missing = self
            .numbers
            .issued()
            .iter()
            .copied()
            .filter(|n| !excluded.contains(n))
            .find(|n| !statement.issued.contains(n));
        if let Some(number) = missing {
            debug!(target: LOG_CLIENT_SESSION, number, "Statement is missing an issued number");
            return false;
        }
        let unexpected = statement.issued.iter().copied().find(|n| {
            excluded.contains(n) || !(self.numbers.is_issued(*n) || included.contains(n))
        });
        if let Some(number) = unexpected {
            debug!(target: LOG_CLIENT_SESSION, number, "Statement lists an unexpected number");
            return false;
        }
        true
    }

    /// Reconcile with a record asserted by the notary
    pub(crate) fn resync(&mut self, record: &SessionRecord) -> bool {
        if record.nym_id != self.nym_id || record.notary_id != self.notary_id {
            warn!(target: LOG_CLIENT_SESSION, "Refusing to resync with a record of another session");
            return false;
        }
        self.request_counter = self.request_counter.max(record.request_counter);
        self.numbers.resync(&record.issued, &record.available)
    }

    /// Forget everything tied to the registration at the notary
    pub(crate) fn retire(&mut self) {
        self.numbers.clear();
        self.accounts.clear();
        self.acknowledged_requests.clear();
        self.revision += 1;
        self.nymbox = None;
        self.nymbox_request = None;
        self.box_receipts.clear();
        self.pending_accept = None;
        self.registered = false;
        self.retired = true;
    }
}

/// [`SessionState`] behind its lock, together with its durable store
#[derive(Debug)]
pub(crate) struct SharedState {
    key: SessionKey,
    state: RwLock<SessionState>,
    store: DynSessionStore,
    persist: bool,
}

impl SharedState {
    pub fn new(state: SessionState, store: DynSessionStore, persist: bool) -> Self {
        Self {
            key: state.key(),
            state: RwLock::new(state),
            store,
            persist,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().expect("lock poison")
    }

    /// Read access that can't outlive the call, for use in async code
    pub fn inspect<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.read())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().expect("lock poison")
    }

    /// Mutate the state, writing the record out if durable fields changed
    ///
    /// The store is written while the lock is held, so records land in the
    /// order the changes were made.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.write();
        if !self.persist {
            return f(&mut state);
        }
        let before = state.mark();
        let was_retired = state.retired;

        let result = f(&mut state);

        if state.retired {
            if !was_retired {
                self.remove_record();
            }
        } else if state.mark() != before {
            if let Err(err) = self.store_record(&state) {
                warn!(target: LOG_CLIENT_DB, err = %err, "Failed to persist session record");
            }
        }
        result
    }

    /// Write the record out unconditionally
    pub fn flush(&self) -> anyhow::Result<()> {
        let state = self.read();
        if !self.persist || state.retired {
            return Ok(());
        }
        self.store_record(&state)
    }

    fn store_record(&self, state: &SessionState) -> anyhow::Result<()> {
        self.store.store(&self.key, state.to_record().encode())?;
        trace!(target: LOG_CLIENT_DB, key = ?self.key, "Persisted session record");
        Ok(())
    }

    fn remove_record(&self) {
        if let Err(err) = self.store.remove(&self.key) {
            warn!(target: LOG_CLIENT_DB, err = %err, "Failed to remove session record");
        } else {
            debug!(target: LOG_CLIENT_DB, key = ?self.key, "Removed session record");
        }
    }
}

#[cfg(test)]
mod tests;
