//! The delivery state machine
//!
//! A delivery carries one caller payload (or none, for a nymbox refresh)
//! through the notary until it reaches a terminal result:
//!
//! ```text
//!   PendingSend ──▶ NeedNymbox ──▶ NeedBoxItems ──▶ NeedProcessNymbox ──▶ Idle
//!        │  ▲            ▲               │                  │
//!        │  └────────────┼───────────────┼──────────────────┘ resend
//!        └───────────────┴───────────────┘ retry
//! ```
//!
//! Every failed step bumps the session's failure count; reaching the
//! configured limit aborts the delivery through `Error` back to `Idle`.
//! Shutdown is checked between steps and cancels a pending exchange.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use otx_core::message::{Command, CommandKind, Reply, ReplyFailure};
use otx_core::signer::DynSigner;
use otx_core::task::{ShuttingDownError, TaskHandle};
use otx_core::transport::{DynTransport, TransportError, TransportEvent};
use otx_core::workflow::{DynWorkflow, WorkflowEvent};
use otx_logging::LOG_CLIENT_DELIVERY;
use strum::Display;
use tokio::sync::{OwnedMutexGuard, oneshot};
use tracing::{debug, info, trace, warn};

use crate::dispatch::{self, ReplyOrigin};
use crate::reconcile::{self, ReconcileOutcome};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeliveryState {
    Idle,
    PendingSend,
    NeedNymbox,
    NeedBoxItems,
    NeedProcessNymbox,
    Error,
}

impl DeliveryState {
    /// Whether a new delivery may start from this state
    pub fn accepts_new_delivery(self) -> bool {
        matches!(self, DeliveryState::Idle | DeliveryState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ReplyStatus {
    NotSent,
    Timeout,
    InvalidReply,
    ValidReply,
    Unnecessary,
    Error,
}

impl From<&TransportError> for ReplyStatus {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout => ReplyStatus::Timeout,
            TransportError::InvalidReply(_) => ReplyStatus::InvalidReply,
            TransportError::Unsendable(_) => ReplyStatus::NotSent,
        }
    }
}

/// Terminal outcome of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub status: ReplyStatus,
    pub reply: Option<Reply>,
}

impl DeliveryResult {
    pub fn not_sent() -> Self {
        Self {
            status: ReplyStatus::NotSent,
            reply: None,
        }
    }

    fn valid(reply: Reply) -> Self {
        Self {
            status: ReplyStatus::ValidReply,
            reply: Some(reply),
        }
    }
}

/// Resolves once the delivery it was returned for is finished
///
/// Never hangs: if the delivery task goes away without answering, the
/// result is [`ReplyStatus::NotSent`].
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Future for DeliveryFuture {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| DeliveryResult::not_sent()))
    }
}

enum Step {
    Next(DeliveryState),
    /// A failed attempt, counted against the failure limit
    Retry {
        status: ReplyStatus,
        next: DeliveryState,
    },
    Done(DeliveryResult),
}

type StepResult = Result<Step, ShuttingDownError>;

/// Result of a single request/reply exchange
type Exchange = Result<Result<Reply, TransportError>, ShuttingDownError>;

pub(crate) struct Delivery {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) signer: DynSigner,
    pub(crate) transport: DynTransport,
    pub(crate) workflow: DynWorkflow,
    pub(crate) failure_limit: u32,
}

impl Delivery {
    pub(crate) fn channel() -> (oneshot::Sender<DeliveryResult>, DeliveryFuture) {
        let (tx, rx) = oneshot::channel();
        (tx, DeliveryFuture { rx })
    }

    pub(crate) async fn run(
        self,
        handle: TaskHandle,
        start: DeliveryState,
        decision: OwnedMutexGuard<()>,
        tx: oneshot::Sender<DeliveryResult>,
    ) {
        let result = self.drive(&handle, start).await;
        info!(
            target: LOG_CLIENT_DELIVERY,
            status = %result.status,
            success = result.reply.as_ref().map(|reply| reply.success),
            "Delivery finished"
        );
        self.shared.update(|state| {
            state.delivery_state = DeliveryState::Idle;
            state.last_status = result.status;
            state.pending_request = None;
            state.pending_reply = None;
            state.awaiting_reply = None;
        });

        // Release before answering, so the caller can queue right away
        drop(decision);
        if tx.send(result).is_err() {
            debug!(target: LOG_CLIENT_DELIVERY, "Caller stopped waiting for the delivery");
        }
    }

    async fn drive(&self, handle: &TaskHandle, start: DeliveryState) -> DeliveryResult {
        let mut current = start;
        loop {
            if handle.is_shutting_down() {
                info!(target: LOG_CLIENT_DELIVERY, state = %current, "Shutting down, abandoning delivery");
                return DeliveryResult::not_sent();
            }
            self.shared.update(|state| state.delivery_state = current);
            debug!(target: LOG_CLIENT_DELIVERY, state = %current, "Delivery step");

            let step = match current {
                DeliveryState::PendingSend => self.pending_send(handle).await,
                DeliveryState::NeedNymbox => self.need_nymbox(handle).await,
                DeliveryState::NeedBoxItems => self.need_box_items(handle).await,
                DeliveryState::NeedProcessNymbox => self.need_process_nymbox(handle).await,
                DeliveryState::Idle | DeliveryState::Error => {
                    warn!(target: LOG_CLIENT_DELIVERY, state = %current, "Delivery started from a terminal state");
                    return DeliveryResult {
                        status: ReplyStatus::Error,
                        reply: None,
                    };
                }
            };

            match step {
                Ok(Step::Next(next)) => current = next,
                Ok(Step::Retry { status, next }) => {
                    let failures = self.shared.update(|state| {
                        state.failure_count += 1;
                        state.last_status = status;
                        state.failure_count
                    });
                    if failures >= self.failure_limit {
                        warn!(
                            target: LOG_CLIENT_DELIVERY,
                            state = %current,
                            %status,
                            failures,
                            "Giving up on delivery"
                        );
                        let reply = self.shared.update(|state| {
                            state.delivery_state = DeliveryState::Error;
                            state.pending_reply.take()
                        });
                        return DeliveryResult {
                            status: ReplyStatus::Error,
                            reply,
                        };
                    }
                    debug!(
                        target: LOG_CLIENT_DELIVERY,
                        state = %current,
                        %next,
                        %status,
                        failures,
                        "Retrying delivery step"
                    );
                    current = next;
                }
                Ok(Step::Done(result)) => return result,
                Err(ShuttingDownError { .. }) => {
                    info!(target: LOG_CLIENT_DELIVERY, state = %current, "Exchange cancelled by shutdown");
                    return DeliveryResult::not_sent();
                }
            }
        }
    }

    /// Sign and send one request, verifying whatever comes back
    async fn exchange(&self, handle: &TaskHandle, command: Command, payload: bool) -> Exchange {
        let request = self.shared.update(|state| {
            let request = state.next_request(command, &*self.signer);
            if payload {
                state.awaiting_reply = Some(request.request_number);
            }
            if request.kind() == CommandKind::ProcessNymbox {
                if let Some(staged) = state.pending_accept.as_mut() {
                    staged.request_number = Some(request.request_number);
                }
            }
            request
        });
        let notary_id = request.notary_id.clone();
        let request_number = request.request_number;
        let kind = request.kind();

        self.transport.notify(TransportEvent::RequestSent {
            notary_id: notary_id.clone(),
            request_number,
            kind,
        });
        trace!(target: LOG_CLIENT_DELIVERY, request_number, %kind, "Sending request");

        let reply = match handle
            .cancel_on_shutdown(self.transport.send(request.clone()))
            .await?
        {
            Ok(reply) => reply,
            Err(err) => {
                debug!(target: LOG_CLIENT_DELIVERY, request_number, %kind, %err, "Request failed");
                return Ok(Err(err));
            }
        };

        let verified = self
            .shared
            .inspect(|state| dispatch::verify_response(&*self.signer, state, &request, &reply));
        if let Err(err) = verified {
            warn!(target: LOG_CLIENT_DELIVERY, request_number, %kind, %err, "Rejecting reply");
            return Ok(Err(err));
        }
        self.transport.notify(TransportEvent::ReplyReceived {
            notary_id,
            request_number,
            kind,
            success: reply.success,
        });
        Ok(Ok(reply))
    }

    /// Dispatch a direct reply, returning whether its handler succeeded
    fn apply(&self, reply: &Reply) -> bool {
        let outcome = self
            .shared
            .update(|state| dispatch::dispatch(state, reply, ReplyOrigin::Direct));
        self.forward(outcome.events);
        outcome.success
    }

    fn forward(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.workflow.process(event);
        }
    }

    async fn pending_send(&self, handle: &TaskHandle) -> StepResult {
        let Some(command) = self.shared.inspect(|state| state.pending_request.clone()) else {
            return Ok(Step::Next(DeliveryState::NeedNymbox));
        };

        let mut resynced = false;
        loop {
            let reply = match self.exchange(handle, command.clone(), true).await? {
                Ok(reply) => reply,
                Err(err) => {
                    // The notary may have processed it; look for a reply notice first
                    return Ok(Step::Retry {
                        status: ReplyStatus::from(&err),
                        next: DeliveryState::NeedNymbox,
                    });
                }
            };

            if reply.failure == Some(ReplyFailure::RequestNumberMismatch) {
                if resynced {
                    return Ok(Step::Retry {
                        status: ReplyStatus::Error,
                        next: DeliveryState::PendingSend,
                    });
                }
                resynced = true;
                info!(target: LOG_CLIENT_DELIVERY, "Notary expects another request number, resyncing");
                if let Err(err) = self.resync_request_number(handle).await? {
                    return Ok(Step::Retry {
                        status: ReplyStatus::from(&err),
                        next: DeliveryState::PendingSend,
                    });
                }
                continue;
            }

            self.apply(&reply);
            let stale = reply.failure == Some(ReplyFailure::StaleNymbox)
                || self.shared.inspect(|state| {
                    reply
                        .nymbox_hash
                        .is_some_and(|digest| digest != state.local_nymbox_digest)
                });
            if stale {
                debug!(
                    target: LOG_CLIENT_DELIVERY,
                    request_number = reply.request_number,
                    "Nymbox changed, reconciling before finishing"
                );
                self.shared.update(|state| state.pending_reply = Some(reply));
                return Ok(Step::Next(DeliveryState::NeedNymbox));
            }
            return Ok(Step::Done(DeliveryResult::valid(reply)));
        }
    }

    async fn resync_request_number(
        &self,
        handle: &TaskHandle,
    ) -> Result<Result<(), TransportError>, ShuttingDownError> {
        let reply = match self.exchange(handle, Command::GetRequestNumber, false).await? {
            Ok(reply) => reply,
            Err(err) => return Ok(Err(err)),
        };
        if self.apply(&reply) {
            Ok(Ok(()))
        } else {
            Ok(Err(TransportError::InvalidReply(
                "notary refused to tell the request number".to_owned(),
            )))
        }
    }

    async fn need_nymbox(&self, handle: &TaskHandle) -> StepResult {
        Ok(match self.exchange(handle, Command::GetNymbox, false).await? {
            Ok(reply) if self.apply(&reply) => Step::Next(DeliveryState::NeedBoxItems),
            Ok(_) => Step::Retry {
                status: ReplyStatus::Error,
                next: DeliveryState::NeedNymbox,
            },
            Err(err) => Step::Retry {
                status: ReplyStatus::from(&err),
                next: DeliveryState::NeedNymbox,
            },
        })
    }

    async fn need_box_items(&self, handle: &TaskHandle) -> StepResult {
        let Some(item_id) = self.shared.inspect(reconcile::missing_receipt) else {
            return Ok(Step::Next(DeliveryState::NeedProcessNymbox));
        };
        trace!(target: LOG_CLIENT_DELIVERY, item_id, "Fetching box receipt");

        Ok(
            match self
                .exchange(handle, Command::GetBoxReceipt { item_id }, false)
                .await?
            {
                Ok(reply) if self.apply(&reply) => Step::Next(DeliveryState::NeedBoxItems),
                // The entry may be gone by now
                Ok(_) => Step::Retry {
                    status: ReplyStatus::Error,
                    next: DeliveryState::NeedNymbox,
                },
                Err(err) => Step::Retry {
                    status: ReplyStatus::from(&err),
                    next: DeliveryState::NeedBoxItems,
                },
            },
        )
    }

    async fn need_process_nymbox(&self, handle: &TaskHandle) -> StepResult {
        let (outcome, events) = self
            .shared
            .update(|state| reconcile::build_accept(state, &*self.signer));
        self.forward(events);

        let accept = match outcome {
            ReconcileOutcome::Empty => return Ok(self.nymbox_done(ReplyStatus::Unnecessary, None)),
            ReconcileOutcome::AlreadyProcessed { duplicates } => {
                debug!(target: LOG_CLIENT_DELIVERY, duplicates, "Only duplicate notices left");
                self.shared.update(|state| state.failure_count = 0);
                return Ok(self.nymbox_done(ReplyStatus::Unnecessary, None));
            }
            ReconcileOutcome::Incomplete { missing } => {
                debug!(target: LOG_CLIENT_DELIVERY, missing, "Box receipts missing");
                return Ok(Step::Next(DeliveryState::NeedBoxItems));
            }
            ReconcileOutcome::Submit(accept) => accept,
        };

        Ok(
            match self
                .exchange(handle, Command::ProcessNymbox { accept }, false)
                .await?
            {
                Ok(reply) if self.apply(&reply) => {
                    self.nymbox_done(ReplyStatus::ValidReply, Some(reply))
                }
                Ok(_) => Step::Retry {
                    status: ReplyStatus::Error,
                    next: DeliveryState::NeedNymbox,
                },
                Err(err) => Step::Retry {
                    status: ReplyStatus::from(&err),
                    next: DeliveryState::NeedNymbox,
                },
            },
        )
    }

    /// Decide where to go once the nymbox is reconciled
    fn nymbox_done(&self, status: ReplyStatus, process_reply: Option<Reply>) -> Step {
        self.shared.update(|state| {
            if state.pending_request.is_none() {
                return Step::Done(DeliveryResult {
                    status,
                    reply: process_reply,
                });
            }
            match state.pending_reply.take() {
                Some(reply) if reply.failure == Some(ReplyFailure::StaleNymbox) => {
                    debug!(target: LOG_CLIENT_DELIVERY, "Resending request with a fresh nymbox");
                    Step::Retry {
                        status: ReplyStatus::Error,
                        next: DeliveryState::PendingSend,
                    }
                }
                Some(reply) => Step::Done(DeliveryResult::valid(reply)),
                None => {
                    debug!(target: LOG_CLIENT_DELIVERY, "No reply found in the nymbox, resending");
                    Step::Next(DeliveryState::PendingSend)
                }
            }
        })
    }
}
