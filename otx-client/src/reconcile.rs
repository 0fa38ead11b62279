//! Nymbox reconciliation
//!
//! Once every entry of the downloaded nymbox has its box receipt, the
//! entries are folded into a single [`AcceptTransaction`]. Numbers granted
//! by the nymbox stay tentative until the notary confirms the accept.

use std::collections::BTreeSet;

use otx_core::message::Reply;
use otx_core::nymbox::{AcceptItem, AcceptTransaction, BoxReceipt, Nymbox};
use otx_core::signer::Signer;
use otx_core::workflow::WorkflowEvent;
use otx_core::{ItemId, RequestNumber, TransactionNumber};
use otx_logging::LOG_CLIENT_NYMBOX;
use tracing::{debug, trace, warn};

use crate::dispatch::{self, ReplyOrigin};
use crate::state::SessionState;

/// Bookkeeping of an accept that was built but not yet confirmed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedAccept {
    /// Request the accept went out under, once sent
    pub request_number: Option<RequestNumber>,
    pub item_ids: BTreeSet<ItemId>,
    /// Tentative numbers promoted to issued on confirmation
    pub promote: BTreeSet<TransactionNumber>,
    /// Numbers this pass made tentative, dropped again on rejection
    pub tentative_added: BTreeSet<TransactionNumber>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing in the nymbox
    Empty,
    /// Every entry is a reply notice that was already processed
    AlreadyProcessed { duplicates: usize },
    /// Some entries still lack their box receipt
    Incomplete { missing: ItemId },
    Submit(AcceptTransaction),
}

/// Replace the local nymbox view with a freshly downloaded one
///
/// `downloaded_at` is the request the nymbox came back for, if known.
pub fn load_nymbox(
    state: &mut SessionState,
    nymbox: Nymbox,
    downloaded_at: Option<RequestNumber>,
) {
    let digest = nymbox.digest();
    state
        .box_receipts
        .retain(|item_id, _| nymbox.get(*item_id).is_some());
    debug!(
        target: LOG_CLIENT_NYMBOX,
        entries = nymbox.len(),
        cached = state.box_receipts.len(),
        %digest,
        "Loaded nymbox"
    );
    state.local_nymbox_digest = digest;
    state.nymbox = Some(nymbox);
    state.nymbox_request = downloaded_at;
}

/// First nymbox entry that has no cached box receipt
pub fn missing_receipt(state: &SessionState) -> Option<ItemId> {
    state
        .nymbox
        .as_ref()?
        .entries
        .iter()
        .map(|entry| entry.item_id)
        .find(|item_id| !state.box_receipts.contains_key(item_id))
}

/// Cache a downloaded box receipt if it matches its nymbox entry
pub fn store_receipt(state: &mut SessionState, item_id: ItemId, receipt: BoxReceipt) -> bool {
    let Some(entry) = state.nymbox.as_ref().and_then(|nymbox| nymbox.get(item_id)) else {
        warn!(target: LOG_CLIENT_NYMBOX, item_id, "Box receipt for an entry we don't have");
        return false;
    };
    if entry.kind != receipt.kind() {
        warn!(
            target: LOG_CLIENT_NYMBOX,
            item_id,
            expected = %entry.kind,
            got = %receipt.kind(),
            "Box receipt does not match its nymbox entry"
        );
        return false;
    }
    trace!(target: LOG_CLIENT_NYMBOX, item_id, kind = %entry.kind, "Cached box receipt");
    state.box_receipts.insert(item_id, receipt);
    true
}

/// Classify every nymbox entry and build the accept for them
pub fn build_accept(
    state: &mut SessionState,
    signer: &dyn Signer,
) -> (ReconcileOutcome, Vec<WorkflowEvent>) {
    let Some(nymbox) = state.nymbox.clone() else {
        return (ReconcileOutcome::Empty, vec![]);
    };
    if nymbox.is_empty() {
        debug!(target: LOG_CLIENT_NYMBOX, "Nymbox is empty");
        return (ReconcileOutcome::Empty, vec![]);
    }
    if let Some(missing) = missing_receipt(state) {
        return (ReconcileOutcome::Incomplete { missing }, vec![]);
    }

    let mut items = Vec::with_capacity(nymbox.len());
    let mut events = vec![];
    let mut staged = StagedAccept::default();
    let mut closed = BTreeSet::new();
    let mut duplicates = 0;

    for entry in &nymbox.entries {
        let item_id = entry.item_id;
        let Some(receipt) = state.box_receipts.get(&item_id).cloned() else {
            return (ReconcileOutcome::Incomplete { missing: item_id }, vec![]);
        };
        trace!(target: LOG_CLIENT_NYMBOX, item_id, kind = %receipt.kind(), "Reconciling entry");

        let item = match receipt {
            BoxReceipt::Message { sender, payload } => {
                events.push(WorkflowEvent::IncomingMessage {
                    item_id,
                    sender,
                    payload,
                });
                AcceptItem::AcceptMessage { item_id }
            }
            BoxReceipt::InstrumentNotice { sender, instrument } => {
                events.push(WorkflowEvent::IncomingInstrument {
                    item_id,
                    sender,
                    instrument,
                });
                AcceptItem::AcceptNotice { item_id }
            }
            BoxReceipt::Notice { .. } => AcceptItem::AcceptNotice { item_id },
            BoxReceipt::SuccessNotice { numbers } => {
                for number in numbers {
                    if state.numbers.is_tentative(number) {
                        staged.promote.insert(number);
                    } else {
                        trace!(target: LOG_CLIENT_NYMBOX, number, "Success notice for a number that isn't tentative");
                    }
                }
                AcceptItem::AcceptNotice { item_id }
            }
            BoxReceipt::ReplyNotice {
                request_number,
                reply,
            } => {
                if state.acknowledged_requests.contains(&request_number) {
                    duplicates += 1;
                } else {
                    events.extend(replay_notice(state, signer, request_number, reply.as_deref()));
                }
                AcceptItem::AcceptNotice { item_id }
            }
            BoxReceipt::BlankNumbers { numbers } => {
                let mut accepted = BTreeSet::new();
                for number in numbers {
                    if state.numbers.add_tentative(number) {
                        staged.tentative_added.insert(number);
                        accepted.insert(number);
                    } else if state.numbers.is_tentative(number) {
                        // Offered again after an accept whose outcome we never learned
                        accepted.insert(number);
                    }
                }
                staged.promote.extend(accepted.iter().copied());
                AcceptItem::AcceptNumbers {
                    item_id,
                    numbers: accepted,
                }
            }
            BoxReceipt::FinalReceipt { closing } => {
                for number in &closing {
                    state.numbers.consume_issued(*number);
                }
                closed.extend(closing.iter().copied());
                AcceptItem::AcceptFinalReceipt { item_id, closing }
            }
        };
        staged.item_ids.insert(item_id);
        items.push(item);
    }

    if duplicates == nymbox.len() {
        debug!(target: LOG_CLIENT_NYMBOX, duplicates, "Nymbox was already processed");
        return (ReconcileOutcome::AlreadyProcessed { duplicates }, events);
    }

    let statement = state.statement(&staged.promote, &closed, signer);
    debug!(
        target: LOG_CLIENT_NYMBOX,
        items = items.len(),
        promote = staged.promote.len(),
        closed = closed.len(),
        "Built nymbox accept"
    );
    if let Some(stale) = state.pending_accept.take() {
        debug!(
            target: LOG_CLIENT_NYMBOX,
            request_number = ?stale.request_number,
            "Superseding unconfirmed accept"
        );
        staged.tentative_added.extend(
            stale
                .tentative_added
                .intersection(&staged.promote)
                .copied(),
        );
    }
    state.pending_accept = Some(staged);
    (
        ReconcileOutcome::Submit(AcceptTransaction { items, statement }),
        events,
    )
}

fn replay_notice(
    state: &mut SessionState,
    signer: &dyn Signer,
    request_number: RequestNumber,
    reply: Option<&Reply>,
) -> Vec<WorkflowEvent> {
    let Some(reply) = reply else {
        debug!(target: LOG_CLIENT_NYMBOX, request_number, "Reply notice without a reply");
        return vec![];
    };
    if let Err(err) = dispatch::verify_reply(signer, state, request_number, reply) {
        warn!(target: LOG_CLIENT_NYMBOX, request_number, %err, "Dropping reply notice");
        return vec![];
    }
    dispatch::dispatch(state, reply, ReplyOrigin::Notice).events
}

/// Apply the notary's verdict on the accept sent as `request_number`
pub fn complete(
    state: &mut SessionState,
    request_number: RequestNumber,
    success: bool,
    accepted: &BTreeSet<ItemId>,
) {
    let matches = state
        .pending_accept
        .as_ref()
        .is_some_and(|staged| staged.request_number == Some(request_number));
    if !matches {
        trace!(target: LOG_CLIENT_NYMBOX, request_number, "No staged accept for this reply");
        return;
    }
    let Some(staged) = state.pending_accept.take() else {
        return;
    };

    if !success {
        for number in &staged.tentative_added {
            state.numbers.remove_tentative(*number);
        }
        warn!(
            target: LOG_CLIENT_NYMBOX,
            request_number,
            dropped = staged.tentative_added.len(),
            "Nymbox accept was rejected"
        );
        return;
    }

    if !state.numbers.accept_issued_numbers(&staged.promote) {
        warn!(target: LOG_CLIENT_NYMBOX, request_number, "Not every staged number could be promoted");
    }
    let removed: BTreeSet<ItemId> = if accepted.is_empty() {
        staged.item_ids
    } else {
        accepted.clone()
    };
    if let Some(nymbox) = state.nymbox.as_mut() {
        nymbox.remove(&removed);
        state.local_nymbox_digest = nymbox.digest();
    }
    state
        .box_receipts
        .retain(|item_id, _| !removed.contains(item_id));
    let pruned = prune_acknowledged(state);
    debug!(
        target: LOG_CLIENT_NYMBOX,
        request_number,
        removed = removed.len(),
        pruned,
        highest = state.numbers.highest(),
        "Nymbox accept confirmed"
    );
}

/// Drop acknowledged requests that no reply notice can refer to any more
///
/// The notary answers requests in order, so a notice for anything sent
/// before the nymbox download was in that nymbox. Once it is accepted, only
/// notices still sitting in the nymbox hold the floor down.
fn prune_acknowledged(state: &mut SessionState) -> usize {
    let Some(downloaded_at) = state.nymbox_request else {
        return 0;
    };
    let floor = state
        .nymbox
        .iter()
        .flat_map(|nymbox| nymbox.entries.iter())
        .filter_map(|entry| entry.request_number)
        .fold(downloaded_at, RequestNumber::min);
    state.prune_acknowledged(floor)
}
