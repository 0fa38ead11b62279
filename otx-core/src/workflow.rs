use std::fmt::Debug;
use std::sync::Arc;

use crate::{AccountId, ItemId, NymId, TransactionNumber};

/// Decoded payloads handed over to payment/transfer tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    IncomingMessage {
        item_id: ItemId,
        sender: NymId,
        payload: String,
    },
    IncomingInstrument {
        item_id: ItemId,
        sender: NymId,
        instrument: String,
    },
    TransactionOutcome {
        number: TransactionNumber,
        account: Option<AccountId>,
        accepted: bool,
    },
}

/// External tracker of payment workflows
///
/// Called after the session state lock has been released; implementations
/// must not call back into the session synchronously.
pub trait Workflow: Debug + Send + Sync {
    fn process(&self, event: WorkflowEvent);
}

pub type DynWorkflow = Arc<dyn Workflow>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorkflow;

impl Workflow for NoopWorkflow {
    fn process(&self, _event: WorkflowEvent) {}
}
