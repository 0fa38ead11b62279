use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use otx_core::message::{
    Command, Reply, ReplyBody, ReplyFailure, Request, TransactionOutcome,
};
use otx_core::nymbox::{AcceptItem, AcceptTransaction, BoxReceipt, Nymbox, NymboxEntry};
use otx_core::signer::Signer as _;
use otx_core::statement::TransactionStatement;
use otx_core::transport::{Transport, TransportError, TransportEvent};
use otx_core::{
    AccountId, ItemId, NotaryId, NymId, NymboxDigest, RequestNumber, Signature,
    TransactionNumber,
};
use otx_logging::LOG_TEST;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::FakeSigner;

/// Instrument text that makes [`FakeNotary`] reject a notarization
pub const REJECTED_INSTRUMENT: &str = "reject";

/// Misbehaviour injected into the next exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Request is lost before the notary sees it
    Timeout,
    /// A reply comes back whose signature does not verify
    InvalidReply,
    /// Request is processed, but the reply only shows up in the nymbox
    DropReply,
}

/// Holds the next box receipt download until released
#[derive(Debug, Default)]
pub struct BoxReceiptGate {
    /// Notified when a download reaches the gate
    pub entered: Notify,
    /// Notify to let the download continue
    pub release: Notify,
}

#[derive(Debug)]
struct NymAccount {
    expected_request: RequestNumber,
    registered: bool,
    issued: BTreeSet<TransactionNumber>,
    nymbox: Vec<(NymboxEntry, BoxReceipt)>,
    accounts: BTreeSet<AccountId>,
    /// Statement of the last accepted process-nymbox
    last_statement: Option<TransactionStatement>,
}

impl Default for NymAccount {
    fn default() -> Self {
        Self {
            expected_request: 1,
            registered: false,
            issued: BTreeSet::new(),
            nymbox: vec![],
            accounts: BTreeSet::new(),
            last_statement: None,
        }
    }
}

impl NymAccount {
    fn nymbox(&self) -> Nymbox {
        Nymbox::new(self.nymbox.iter().map(|(entry, _)| entry.clone()).collect())
    }
}

#[derive(Debug)]
struct NotaryState {
    nyms: BTreeMap<NymId, NymAccount>,
    next_number: TransactionNumber,
    next_item_id: ItemId,
    next_account: u64,
    require_fresh_nymbox: bool,
    faults: VecDeque<Fault>,
    requests: Vec<Request>,
    events: Vec<TransportEvent>,
    box_receipt_gate: Option<Arc<BoxReceiptGate>>,
}

impl NotaryState {
    fn nym(&mut self, nym_id: &NymId) -> &mut NymAccount {
        self.nyms.entry(nym_id.clone()).or_default()
    }

    fn push(&mut self, nym_id: &NymId, receipt: BoxReceipt) -> ItemId {
        self.next_item_id += 1;
        let item_id = self.next_item_id;
        let request_number = match &receipt {
            BoxReceipt::ReplyNotice { request_number, .. } => Some(*request_number),
            _ => None,
        };
        let entry = NymboxEntry {
            item_id,
            kind: receipt.kind(),
            request_number,
        };
        self.nym(nym_id).nymbox.push((entry, receipt));
        item_id
    }

    fn grant(&mut self, nym_id: &NymId, count: u32) -> BTreeSet<TransactionNumber> {
        let first = self.next_number;
        self.next_number += u64::from(count);
        let numbers: BTreeSet<_> = (first..self.next_number).collect();
        self.push(
            nym_id,
            BoxReceipt::BlankNumbers {
                numbers: numbers.clone(),
            },
        );
        numbers
    }
}

/// In-memory notary speaking the request/reply protocol
///
/// Implements [`Transport`] directly, so a session can be pointed at it.
#[derive(Debug)]
pub struct FakeNotary {
    notary_id: NotaryId,
    signer: FakeSigner,
    state: Mutex<NotaryState>,
}

impl FakeNotary {
    pub fn new(notary_id: &str) -> Self {
        info!(target: LOG_TEST, notary_id, "Setting up fake notary");
        Self {
            notary_id: NotaryId::from(notary_id),
            signer: FakeSigner::new(notary_id),
            state: Mutex::new(NotaryState {
                nyms: BTreeMap::new(),
                next_number: 1,
                next_item_id: 0,
                next_account: 0,
                require_fresh_nymbox: false,
                faults: VecDeque::new(),
                requests: vec![],
                events: vec![],
                box_receipt_gate: None,
            }),
        }
    }

    /// Start issuing transaction numbers at `first`
    pub fn with_first_number(self, first: TransactionNumber) -> Self {
        self.lock().next_number = first;
        self
    }

    /// Refuse notarizations built against an outdated nymbox
    pub fn with_fresh_nymbox_required(self) -> Self {
        self.lock().require_fresh_nymbox = true;
        self
    }

    pub fn notary_id(&self) -> NotaryId {
        self.notary_id.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotaryState> {
        self.state.lock().expect("lock poison")
    }

    /// Apply `fault` to the next `times` requests
    pub fn inject(&self, fault: Fault, times: usize) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat_n(fault, times));
    }

    /// Put a grant of `count` fresh numbers into the nym's nymbox
    pub fn grant_numbers(&self, nym_id: &NymId, count: u32) -> BTreeSet<TransactionNumber> {
        self.lock().grant(nym_id, count)
    }

    /// Put an arbitrary receipt into the nym's nymbox
    ///
    /// Numbers closed by a final receipt stop being issued right away.
    pub fn push_receipt(&self, nym_id: &NymId, receipt: BoxReceipt) -> ItemId {
        let mut state = self.lock();
        if let BoxReceipt::FinalReceipt { closing } = &receipt {
            let nym = state.nym(nym_id);
            for number in closing {
                nym.issued.remove(number);
            }
        }
        state.push(nym_id, receipt)
    }

    /// Expect request numbers from `next` on
    pub fn set_expected_request(&self, nym_id: &NymId, next: RequestNumber) {
        self.lock().nym(nym_id).expected_request = next;
    }

    pub fn issued(&self, nym_id: &NymId) -> BTreeSet<TransactionNumber> {
        self.lock().nym(nym_id).issued.clone()
    }

    pub fn accounts(&self, nym_id: &NymId) -> BTreeSet<AccountId> {
        self.lock().nym(nym_id).accounts.clone()
    }

    pub fn is_registered(&self, nym_id: &NymId) -> bool {
        self.lock().nym(nym_id).registered
    }

    pub fn nymbox_len(&self, nym_id: &NymId) -> usize {
        self.lock().nym(nym_id).nymbox.len()
    }

    pub fn nymbox_digest(&self, nym_id: &NymId) -> NymboxDigest {
        self.lock().nym(nym_id).nymbox().digest()
    }

    /// Every request received so far, faulted ones included
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.lock().events.clone()
    }

    /// Hold the next box receipt download until the returned gate is released
    pub fn pause_box_receipts(&self) -> Arc<BoxReceiptGate> {
        let gate = Arc::new(BoxReceiptGate::default());
        self.lock().box_receipt_gate = Some(gate.clone());
        gate
    }

    fn sign(&self, mut reply: Reply) -> Reply {
        reply.signature = self.signer.sign(&reply.signing_bytes());
        reply
    }

    fn build_reply(
        &self,
        state: &mut NotaryState,
        request: &Request,
        success: bool,
        failure: Option<ReplyFailure>,
        body: ReplyBody,
    ) -> Reply {
        let nymbox_hash = Some(state.nym(&request.nym_id).nymbox().digest());
        self.sign(Reply {
            request_number: request.request_number,
            nym_id: request.nym_id.clone(),
            notary_id: self.notary_id.clone(),
            success,
            failure,
            nymbox_hash,
            body,
            signature: Signature::default(),
        })
    }

    fn refuse(&self, state: &mut NotaryState, request: &Request, failure: ReplyFailure) -> Reply {
        debug!(target: LOG_TEST, request_number = request.request_number, ?failure, "Refusing request");
        let body = empty_body(&request.command);
        self.build_reply(state, request, false, Some(failure), body)
    }

    fn process(&self, state: &mut NotaryState, request: &Request) -> Reply {
        let nym_id = &request.nym_id;
        if request.notary_id != self.notary_id
            || !self.signer.verify(
                nym_id.as_str(),
                &request.signing_bytes(),
                &request.signature,
            )
        {
            return self.refuse(state, request, ReplyFailure::Rejected("bad request".into()));
        }

        if !matches!(request.command, Command::GetRequestNumber) {
            let nym = state.nym(nym_id);
            if request.request_number < nym.expected_request {
                return self.refuse(state, request, ReplyFailure::RequestNumberMismatch);
            }
            nym.expected_request = request.request_number + 1;
        }

        let (success, body) = match &request.command {
            Command::RegisterNym => {
                state.nym(nym_id).registered = true;
                (true, ReplyBody::RegisterNym)
            }
            Command::UnregisterNym => {
                let nym = state.nym(nym_id);
                let expected_request = nym.expected_request;
                *nym = NymAccount {
                    expected_request,
                    ..NymAccount::default()
                };
                (true, ReplyBody::UnregisterNym)
            }
            Command::GetRequestNumber => {
                let next = state.nym(nym_id).expected_request;
                (true, ReplyBody::GetRequestNumber { next })
            }
            Command::GetTransactionNumbers { count } => {
                state.grant(nym_id, *count);
                (true, ReplyBody::GetTransactionNumbers)
            }
            Command::RegisterAccount { unit } => {
                state.next_account += 1;
                let account = AccountId::new(format!("{unit}-{}", state.next_account));
                state.nym(nym_id).accounts.insert(account.clone());
                (
                    true,
                    ReplyBody::RegisterAccount {
                        account: Some(account),
                    },
                )
            }
            Command::DeleteAccount { account } => {
                let removed = state.nym(nym_id).accounts.remove(account);
                (
                    removed,
                    ReplyBody::DeleteAccount {
                        account: account.clone(),
                    },
                )
            }
            Command::GetNymbox => (
                true,
                ReplyBody::GetNymbox {
                    nymbox: Some(state.nym(nym_id).nymbox()),
                },
            ),
            Command::GetBoxReceipt { item_id } => {
                let receipt = state
                    .nym(nym_id)
                    .nymbox
                    .iter()
                    .find(|(entry, _)| entry.item_id == *item_id)
                    .map(|(_, receipt)| receipt.clone());
                (
                    receipt.is_some(),
                    ReplyBody::GetBoxReceipt {
                        item_id: *item_id,
                        receipt,
                    },
                )
            }
            Command::ProcessNymbox { accept } => {
                if !self.signer.verify(
                    nym_id.as_str(),
                    &accept.statement.signing_bytes(),
                    &accept.statement.signature,
                ) {
                    return self.refuse(state, request, ReplyFailure::Rejected("bad statement".into()));
                }
                let nym = state.nym(nym_id);
                let added = announced_numbers(nym, accept);
                let consistent = nym
                    .last_statement
                    .as_ref()
                    .is_none_or(|last| last.verify_successor(&accept.statement, &added));
                if !consistent {
                    return self.refuse(
                        state,
                        request,
                        ReplyFailure::Rejected("statement lists unannounced numbers".into()),
                    );
                }
                let nym = state.nym(nym_id);
                let accepted = process_accept(nym, accept);
                nym.last_statement = Some(accept.statement.clone());
                (
                    accepted.len() == accept.items.len(),
                    ReplyBody::ProcessNymbox { accepted },
                )
            }
            Command::NotarizeTransaction { transaction } => {
                let current = state.nym(nym_id).nymbox().digest();
                if state.require_fresh_nymbox && request.nymbox_hash != current {
                    return self.refuse(state, request, ReplyFailure::StaleNymbox);
                }
                let number = transaction.number;
                if !state.nym(nym_id).issued.remove(&number) {
                    return self.refuse(
                        state,
                        request,
                        ReplyFailure::Rejected(format!("{number} is not issued")),
                    );
                }
                let outcome = if transaction.instrument == REJECTED_INSTRUMENT {
                    TransactionOutcome::Rejected
                } else {
                    TransactionOutcome::Accepted {
                        closed: BTreeSet::new(),
                    }
                };
                (
                    true,
                    ReplyBody::NotarizeTransaction {
                        number,
                        outcome: Some(outcome),
                    },
                )
            }
            Command::SendNymMessage { recipient, payload } => {
                state.push(
                    recipient,
                    BoxReceipt::Message {
                        sender: nym_id.clone(),
                        payload: payload.clone(),
                    },
                );
                (true, ReplyBody::SendNymMessage)
            }
        };

        let failure = (!success).then(|| ReplyFailure::Rejected(format!("{} failed", request.kind())));
        self.build_reply(state, request, success, failure, body)
    }
}

/// Numbers an accept may add to the issued set
fn announced_numbers(
    nym: &NymAccount,
    accept: &AcceptTransaction,
) -> BTreeSet<TransactionNumber> {
    let mut added = accept.accepted_numbers();
    for item in &accept.items {
        let notice = nym
            .nymbox
            .iter()
            .find(|(entry, _)| entry.item_id == item.item_id());
        if let Some((_, BoxReceipt::SuccessNotice { numbers })) = notice {
            added.extend(numbers.iter().copied());
        }
    }
    added
}

fn process_accept(nym: &mut NymAccount, accept: &AcceptTransaction) -> BTreeSet<ItemId> {
    let mut accepted = BTreeSet::new();
    for item in &accept.items {
        let Some(pos) = nym
            .nymbox
            .iter()
            .position(|(entry, _)| entry.item_id == item.item_id())
        else {
            warn!(target: LOG_TEST, item_id = item.item_id(), "Accept for an unknown nymbox entry");
            continue;
        };
        if let (AcceptItem::AcceptNumbers { numbers, .. }, BoxReceipt::BlankNumbers { numbers: offered }) =
            (item, &nym.nymbox[pos].1)
        {
            nym.issued.extend(numbers.intersection(offered).copied());
        }
        nym.nymbox.remove(pos);
        accepted.insert(item.item_id());
    }
    if accept.statement.issued != nym.issued {
        warn!(
            target: LOG_TEST,
            client = ?accept.statement.issued,
            notary = ?nym.issued,
            "Accept statement disagrees with issued numbers"
        );
    }
    accepted
}

/// Reply body of the right kind for a request that was not carried out
fn empty_body(command: &Command) -> ReplyBody {
    match command {
        Command::RegisterNym => ReplyBody::RegisterNym,
        Command::UnregisterNym => ReplyBody::UnregisterNym,
        Command::GetRequestNumber => ReplyBody::GetRequestNumber { next: 0 },
        Command::GetTransactionNumbers { .. } => ReplyBody::GetTransactionNumbers,
        Command::RegisterAccount { .. } => ReplyBody::RegisterAccount { account: None },
        Command::DeleteAccount { account } => ReplyBody::DeleteAccount {
            account: account.clone(),
        },
        Command::GetNymbox => ReplyBody::GetNymbox { nymbox: None },
        Command::GetBoxReceipt { item_id } => ReplyBody::GetBoxReceipt {
            item_id: *item_id,
            receipt: None,
        },
        Command::ProcessNymbox { .. } => ReplyBody::ProcessNymbox {
            accepted: BTreeSet::new(),
        },
        Command::NotarizeTransaction { transaction } => ReplyBody::NotarizeTransaction {
            number: transaction.number,
            outcome: None,
        },
        Command::SendNymMessage { .. } => ReplyBody::SendNymMessage,
    }
}

#[async_trait]
impl Transport for FakeNotary {
    async fn send(&self, request: Request) -> Result<Reply, TransportError> {
        let gate = if matches!(request.command, Command::GetBoxReceipt { .. }) {
            self.lock().box_receipt_gate.take()
        } else {
            None
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.lock();
        state.requests.push(request.clone());
        match state.faults.pop_front() {
            None => Ok(self.process(&mut state, &request)),
            Some(Fault::Timeout) => {
                debug!(target: LOG_TEST, request_number = request.request_number, "Losing request");
                Err(TransportError::Timeout)
            }
            Some(Fault::InvalidReply) => {
                debug!(target: LOG_TEST, request_number = request.request_number, "Garbling reply");
                let body = empty_body(&request.command);
                let mut reply = self.build_reply(&mut state, &request, false, None, body);
                reply.signature = Signature(vec![0xde, 0xad]);
                Ok(reply)
            }
            Some(Fault::DropReply) => {
                let reply = self.process(&mut state, &request);
                debug!(target: LOG_TEST, request_number = request.request_number, "Dropping reply into the nymbox");
                state.push(
                    &request.nym_id,
                    BoxReceipt::ReplyNotice {
                        request_number: request.request_number,
                        reply: Some(Box::new(reply)),
                    },
                );
                Err(TransportError::Timeout)
            }
        }
    }

    fn notify(&self, event: TransportEvent) {
        self.lock().events.push(event);
    }
}
