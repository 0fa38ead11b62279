use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use otx_core::message::Command;
use otx_core::signer::DynSigner;
use otx_core::statement::TransactionStatement;
use otx_core::task::TaskGroup;
use otx_core::transport::DynTransport;
use otx_core::workflow::{DynWorkflow, NoopWorkflow};
use otx_core::{AccountId, NotaryId, NymId, RequestNumber, TransactionNumber};
use otx_logging::LOG_CLIENT_SESSION;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::db::{DynSessionStore, MemSessionStore, SessionKey, SessionRecord};
use crate::delivery::{Delivery, DeliveryFuture, DeliveryState, ReplyStatus};
use crate::error::SessionError;
use crate::ledger::{ManagedNumber, NumberPurpose};
use crate::state::{SessionState, SharedState};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Used to configure and build a [`Session`]
pub struct SessionBuilder {
    notary_id: NotaryId,
    signer: DynSigner,
    transport: DynTransport,
    store: Option<DynSessionStore>,
    workflow: Option<DynWorkflow>,
    config: SessionConfig,
    task_group: Option<TaskGroup>,
}

impl SessionBuilder {
    pub fn new(notary_id: NotaryId, signer: DynSigner, transport: DynTransport) -> Self {
        Self {
            notary_id,
            signer,
            transport,
            store: None,
            workflow: None,
            config: SessionConfig::default(),
            task_group: None,
        }
    }

    /// Where the session record lives; in memory if not set
    pub fn with_store(mut self, store: DynSessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_workflow(mut self, workflow: DynWorkflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Run deliveries on an existing task group instead of a private one
    pub fn with_task_group(mut self, task_group: TaskGroup) -> Self {
        self.task_group = Some(task_group);
        self
    }

    /// Build the session, resuming from a stored record if there is one
    pub fn build(self) -> anyhow::Result<Session> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemSessionStore::new()));
        let key = SessionKey {
            nym_id: self.signer.nym_id(),
            notary_id: self.notary_id.clone(),
        };

        let state = match store.load(&key).context("loading session record")? {
            Some(bytes) => {
                let record = SessionRecord::decode(&bytes)?;
                info!(
                    target: LOG_CLIENT_SESSION,
                    nym = %key.nym_id,
                    notary = %key.notary_id,
                    highest = record.highest_number,
                    issued = record.issued.len(),
                    "Resuming session"
                );
                SessionState::from_record(record, self.config.number_reserve)
            }
            None => {
                info!(
                    target: LOG_CLIENT_SESSION,
                    nym = %key.nym_id,
                    notary = %key.notary_id,
                    "Starting new session"
                );
                SessionState::new(
                    key.nym_id.clone(),
                    key.notary_id.clone(),
                    self.config.number_reserve,
                )
            }
        };
        let shared = Arc::new(SharedState::new(state, store, self.config.persist));
        shared.flush().context("writing session record")?;

        Ok(Session {
            inner: Arc::new(SessionInner {
                shared,
                signer: self.signer,
                transport: self.transport,
                workflow: self.workflow.unwrap_or_else(|| Arc::new(NoopWorkflow)),
                config: self.config,
                task_group: self.task_group.unwrap_or_default(),
                decision: Arc::new(Mutex::new(())),
            }),
        })
    }
}

struct SessionInner {
    shared: Arc<SharedState>,
    signer: DynSigner,
    transport: DynTransport,
    workflow: DynWorkflow,
    config: SessionConfig,
    task_group: TaskGroup,
    /// Held by the running delivery; at most one per session
    decision: Arc<Mutex<()>>,
}

/// Consensus context of one nym at one notary
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.shared.read();
        f.debug_struct("Session")
            .field("nym_id", &state.nym_id)
            .field("notary_id", &state.notary_id)
            .field("delivery_state", &state.delivery_state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Deliver `command` to the notary
    ///
    /// Fails with [`SessionError::Busy`] if another delivery is running.
    pub fn queue(&self, command: Command) -> Result<DeliveryFuture, SessionError> {
        self.start(DeliveryState::PendingSend, Some(command))
    }

    /// Download and process the nymbox without a payload
    pub fn refresh_nymbox(&self) -> Result<DeliveryFuture, SessionError> {
        self.start(DeliveryState::NeedNymbox, None)
    }

    fn start(
        &self,
        start: DeliveryState,
        payload: Option<Command>,
    ) -> Result<DeliveryFuture, SessionError> {
        if self.inner.task_group.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        let decision = self
            .inner
            .decision
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::Busy)?;
        let current = self.inner.shared.inspect(|state| state.delivery_state);
        if !current.accepts_new_delivery() {
            warn!(target: LOG_CLIENT_SESSION, state = %current, "Delivery state is not terminal");
            return Err(SessionError::Busy);
        }

        let kind = payload.as_ref().map(Command::kind);
        debug!(target: LOG_CLIENT_SESSION, %start, ?kind, "Starting delivery");
        self.inner.shared.update(|state| {
            state.delivery_state = start;
            state.pending_request = payload;
            state.pending_reply = None;
            state.awaiting_reply = None;
            state.failure_count = 0;
        });

        let (tx, fut) = Delivery::channel();
        let delivery = Delivery {
            shared: self.inner.shared.clone(),
            signer: self.inner.signer.clone(),
            transport: self.inner.transport.clone(),
            workflow: self.inner.workflow.clone(),
            failure_limit: self.inner.config.failure_limit.max(1),
        };
        let name = match kind {
            Some(kind) => format!("delivery {kind}"),
            None => "nymbox refresh".to_owned(),
        };
        self.inner
            .task_group
            .spawn(name, move |handle| delivery.run(handle, start, decision, tx));
        Ok(fut)
    }

    pub fn nym_id(&self) -> NymId {
        self.inner.shared.inspect(|state| state.nym_id.clone())
    }

    pub fn notary_id(&self) -> NotaryId {
        self.inner.shared.inspect(|state| state.notary_id.clone())
    }

    /// Highest transaction number ever issued to this nym here
    pub fn highest(&self) -> TransactionNumber {
        self.inner.shared.inspect(|state| state.numbers.highest())
    }

    pub fn accounts(&self) -> BTreeSet<AccountId> {
        self.inner.shared.inspect(|state| state.accounts.clone())
    }

    pub fn issued(&self) -> BTreeSet<TransactionNumber> {
        self.inner
            .shared
            .inspect(|state| state.numbers.issued().clone())
    }

    pub fn available(&self) -> BTreeSet<TransactionNumber> {
        self.inner
            .shared
            .inspect(|state| state.numbers.available().clone())
    }

    pub fn tentative(&self) -> BTreeSet<TransactionNumber> {
        self.inner
            .shared
            .inspect(|state| state.numbers.tentative().clone())
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.inner.shared.inspect(|state| state.delivery_state)
    }

    pub fn last_status(&self) -> ReplyStatus {
        self.inner.shared.inspect(|state| state.last_status)
    }

    pub fn request_counter(&self) -> RequestNumber {
        self.inner.shared.inspect(|state| state.request_counter)
    }

    pub fn is_registered(&self) -> bool {
        self.inner.shared.inspect(|state| state.registered)
    }

    /// Draw a number to sign a transaction out under
    ///
    /// The number goes back to the available set when the handle is dropped
    /// without [`ManagedNumber::set_success`].
    pub fn next_transaction_number(
        &self,
        purpose: NumberPurpose,
    ) -> Result<ManagedNumber, SessionError> {
        ManagedNumber::allocate(&self.inner.shared, purpose)
            .ok_or(SessionError::NumberExhausted { purpose })
    }

    /// Signed statement of the current numbers with pending changes applied
    pub fn statement(
        &self,
        adding: &BTreeSet<TransactionNumber>,
        without: &BTreeSet<TransactionNumber>,
    ) -> TransactionStatement {
        self.inner
            .shared
            .inspect(|state| state.statement(adding, without, &*self.inner.signer))
    }

    /// Whether `statement` lists exactly the numbers issued to us
    pub fn verify(&self, statement: &TransactionStatement) -> bool {
        self.verify_with(statement, &BTreeSet::new(), &BTreeSet::new())
    }

    /// [`Self::verify`] allowing for numbers being closed (`excluded`) or
    /// granted (`included`) by the operation the statement belongs to
    pub fn verify_with(
        &self,
        statement: &TransactionStatement,
        excluded: &BTreeSet<TransactionNumber>,
        included: &BTreeSet<TransactionNumber>,
    ) -> bool {
        self.inner.shared.inspect(|state| {
            state.verify_statement(statement, excluded, included, &*self.inner.signer)
        })
    }

    /// Durable snapshot of the session
    pub fn serialize(&self) -> SessionRecord {
        self.inner.shared.inspect(SessionState::to_record)
    }

    /// Write the session record now, reporting failures
    ///
    /// Deliveries persist on their own and only log write failures.
    pub fn persist(&self) -> Result<(), SessionError> {
        self.inner.shared.flush().map_err(SessionError::Persistence)
    }

    /// Reconcile with a record asserted by the notary
    ///
    /// Returns whether every number the record lists was admitted.
    pub fn resync(&self, record: &SessionRecord) -> bool {
        let accepted = self.inner.shared.update(|state| state.resync(record));
        trace!(target: LOG_CLIENT_SESSION, accepted, "Resynced session");
        accepted
    }

    /// Stop the session, resolving any running delivery as not sent
    pub async fn shutdown(&self) {
        debug!(target: LOG_CLIENT_SESSION, "Shutting down session");
        if let Err(err) = self
            .inner
            .task_group
            .clone()
            .shutdown_join_all(Some(SHUTDOWN_TIMEOUT))
            .await
        {
            warn!(target: LOG_CLIENT_SESSION, err = %err, "Error waiting for session tasks to shut down");
        }
    }
}
