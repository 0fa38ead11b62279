use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{CommandKind, Reply, Request};
use crate::{NotaryId, RequestNumber};

/// Failure to obtain a reply for a request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Timed out waiting for a reply")]
    Timeout,
    #[error("Invalid reply: {0}")]
    InvalidReply(String),
    #[error("Request could not be sent: {0}")]
    Unsendable(String),
}

/// Best-effort telemetry about traffic on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RequestSent {
        notary_id: NotaryId,
        request_number: RequestNumber,
        kind: CommandKind,
    },
    ReplyReceived {
        notary_id: NotaryId,
        request_number: RequestNumber,
        kind: CommandKind,
        success: bool,
    },
}

/// Request/reply messaging to one notary
///
/// One request produces at most one reply. Whatever timeout applies to a
/// single exchange is enforced by the implementation.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    async fn send(&self, request: Request) -> Result<Reply, TransportError>;

    /// Fire-and-forget notification; nothing may depend on it for correctness
    fn notify(&self, _event: TransportEvent) {}
}

pub type DynTransport = Arc<dyn Transport>;
