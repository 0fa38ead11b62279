//! Routing of authenticated replies to their bookkeeping

use otx_core::message::{
    Command, CommandKind, Reply, ReplyBody, ReplyFailure, Request, TransactionOutcome,
};
use otx_core::signer::Signer;
use otx_core::transport::TransportError;
use otx_core::workflow::WorkflowEvent;
use otx_core::{RequestNumber, TransactionNumber};
use otx_logging::LOG_CLIENT_DISPATCH;
use tracing::{debug, info, trace, warn};

use crate::reconcile;
use crate::state::SessionState;

/// How a reply reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOrigin {
    /// Answer to a request we just sent
    Direct,
    /// Copy found in a reply notice in the nymbox
    Notice,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub success: bool,
    /// The reply was processed before and had no effect this time
    pub duplicate: bool,
    /// To be handed to the workflow collaborator once the lock is released
    pub events: Vec<WorkflowEvent>,
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidReply(reason.into())
}

/// Check that `reply` is a notary-signed reply for this session
pub fn verify_reply(
    signer: &dyn Signer,
    state: &SessionState,
    request_number: RequestNumber,
    reply: &Reply,
) -> Result<(), TransportError> {
    if reply.request_number != request_number {
        return Err(invalid(format!(
            "reply is for request {} instead of {request_number}",
            reply.request_number
        )));
    }
    if reply.nym_id != state.nym_id || reply.notary_id != state.notary_id {
        return Err(invalid("reply is for a different session"));
    }
    if !signer.verify(
        reply.notary_id.as_str(),
        &reply.signing_bytes(),
        &reply.signature,
    ) {
        return Err(invalid("notary signature does not verify"));
    }
    Ok(())
}

/// [`verify_reply`] plus a check that the reply answers `request`
pub fn verify_response(
    signer: &dyn Signer,
    state: &SessionState,
    request: &Request,
    reply: &Reply,
) -> Result<(), TransportError> {
    verify_reply(signer, state, request.request_number, reply)?;
    let kind = reply.kind();
    if kind != request.kind() && kind != CommandKind::Unknown {
        return Err(invalid(format!(
            "{kind} reply to a {} request",
            request.kind()
        )));
    }
    Ok(())
}

/// Apply a verified reply to the session state
///
/// A reply whose request number was already acknowledged is a duplicate and
/// changes nothing.
pub fn dispatch(state: &mut SessionState, reply: &Reply, origin: ReplyOrigin) -> DispatchOutcome {
    let request_number = reply.request_number;
    if !state.acknowledge(request_number) {
        debug!(
            target: LOG_CLIENT_DISPATCH,
            request_number,
            kind = %reply.kind(),
            ?origin,
            "Ignoring already processed reply"
        );
        return DispatchOutcome {
            success: reply.success,
            duplicate: true,
            events: vec![],
        };
    }
    if origin == ReplyOrigin::Direct {
        if let Some(digest) = reply.nymbox_hash {
            state.remote_nymbox_digest = digest;
        }
    }
    if origin == ReplyOrigin::Notice && state.awaiting_reply == Some(request_number) {
        debug!(target: LOG_CLIENT_DISPATCH, request_number, "Recovered reply from nymbox");
        state.pending_reply = Some(reply.clone());
    }

    trace!(
        target: LOG_CLIENT_DISPATCH,
        request_number,
        kind = %reply.kind(),
        success = reply.success,
        ?origin,
        "Dispatching reply"
    );
    let mut events = vec![];
    let success = match &reply.body {
        ReplyBody::RegisterNym => {
            if reply.success {
                state.registered = true;
                state.retired = false;
            }
            reply.success
        }
        ReplyBody::UnregisterNym => {
            if reply.success {
                info!(target: LOG_CLIENT_DISPATCH, nym = %state.nym_id, "Nym unregistered");
                state.retire();
            }
            reply.success
        }
        ReplyBody::GetRequestNumber { next } => {
            if reply.success && origin == ReplyOrigin::Direct {
                let last_used = next.saturating_sub(1);
                if last_used > state.request_counter {
                    debug!(
                        target: LOG_CLIENT_DISPATCH,
                        from = state.request_counter,
                        to = last_used,
                        "Advancing request counter"
                    );
                    state.request_counter = last_used;
                }
            }
            reply.success
        }
        ReplyBody::GetTransactionNumbers | ReplyBody::SendNymMessage => reply.success,
        ReplyBody::RegisterAccount { account } => match (reply.success, account) {
            (true, Some(account)) => {
                state.add_account(account.clone());
                true
            }
            (true, None) => {
                warn!(target: LOG_CLIENT_DISPATCH, request_number, "Account registration without an id");
                false
            }
            (false, _) => false,
        },
        ReplyBody::DeleteAccount { account } => {
            if reply.success {
                state.remove_account(account);
            }
            reply.success
        }
        ReplyBody::GetNymbox { nymbox } => match (origin, reply.success, nymbox) {
            (ReplyOrigin::Notice, ..) => reply.success,
            (ReplyOrigin::Direct, true, Some(nymbox)) => {
                reconcile::load_nymbox(state, nymbox.clone(), Some(request_number));
                true
            }
            (ReplyOrigin::Direct, ..) => false,
        },
        ReplyBody::GetBoxReceipt { item_id, receipt } => match (origin, reply.success, receipt) {
            (ReplyOrigin::Notice, ..) => reply.success,
            (ReplyOrigin::Direct, true, Some(receipt)) => {
                reconcile::store_receipt(state, *item_id, receipt.clone())
            }
            (ReplyOrigin::Direct, ..) => false,
        },
        ReplyBody::ProcessNymbox { accepted } => {
            reconcile::complete(state, request_number, reply.success, accepted);
            reply.success
        }
        ReplyBody::NotarizeTransaction { number, outcome } => {
            notarized(state, reply, *number, outcome.as_ref(), &mut events);
            reply.success
        }
        ReplyBody::Unknown => {
            info!(
                target: LOG_CLIENT_DISPATCH,
                request_number,
                "Ignoring reply to an unknown command"
            );
            true
        }
    };

    DispatchOutcome {
        success,
        duplicate: false,
        events,
    }
}

fn notarized(
    state: &mut SessionState,
    reply: &Reply,
    number: TransactionNumber,
    outcome: Option<&TransactionOutcome>,
    events: &mut Vec<WorkflowEvent>,
) {
    let account = match &state.pending_request {
        Some(Command::NotarizeTransaction { transaction }) if transaction.number == number => {
            Some(transaction.account.clone())
        }
        _ => None,
    };

    let accepted = match (reply.success, outcome) {
        (false, _) | (true, None) => {
            // The notary never looked at the transaction
            recover_refused(state, reply, number, account.is_some());
            return;
        }
        (true, Some(TransactionOutcome::Rejected)) => {
            state.numbers.consume_issued(number);
            false
        }
        (true, Some(TransactionOutcome::Accepted { closed })) => {
            state.numbers.consume_issued(number);
            for closed in closed {
                state.numbers.consume_issued(*closed);
            }
            true
        }
    };
    debug!(target: LOG_CLIENT_DISPATCH, number, accepted, "Transaction notarized");
    events.push(WorkflowEvent::TransactionOutcome {
        number,
        account,
        accepted,
    });
}

/// Make the number of a refused notarization usable again
///
/// Only our own pending payload qualifies, and only once the delivery
/// won't resend it under the same number.
fn recover_refused(
    state: &mut SessionState,
    reply: &Reply,
    number: TransactionNumber,
    pending: bool,
) {
    let retried = matches!(
        reply.failure,
        Some(ReplyFailure::StaleNymbox | ReplyFailure::RequestNumberMismatch)
    );
    if !pending || !state.numbers.is_issued(number) {
        warn!(
            target: LOG_CLIENT_DISPATCH,
            number,
            pending,
            "Refused notarization for a number we didn't send"
        );
    } else if retried {
        debug!(target: LOG_CLIENT_DISPATCH, number, "Notarization will be resent, keeping its number");
    } else {
        let recovered = state.numbers.recover_available(number);
        debug!(target: LOG_CLIENT_DISPATCH, number, recovered, "Notarization refused");
    }
}
