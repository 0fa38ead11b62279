//! Requests sent to a notary and the replies it answers with

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::nymbox::{AcceptTransaction, BoxReceipt, Nymbox};
use crate::{
    AccountId, ItemId, NotaryId, NymId, NymboxDigest, RequestNumber, Signature,
    TransactionNumber, canonical_bytes,
};

/// Command kinds understood by the notary, used for routing and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CommandKind {
    RegisterNym,
    UnregisterNym,
    GetRequestNumber,
    GetTransactionNumbers,
    RegisterAccount,
    DeleteAccount,
    GetNymbox,
    GetBoxReceipt,
    ProcessNymbox,
    NotarizeTransaction,
    SendNymMessage,
    Unknown,
}

/// A transaction submitted for notarization
///
/// The instrument itself is opaque to the session; only the transaction
/// number it is signed out under matters for number accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTransaction {
    pub number: TransactionNumber,
    pub account: AccountId,
    pub instrument: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    RegisterNym,
    UnregisterNym,
    GetRequestNumber,
    GetTransactionNumbers { count: u32 },
    RegisterAccount { unit: String },
    DeleteAccount { account: AccountId },
    GetNymbox,
    GetBoxReceipt { item_id: ItemId },
    ProcessNymbox { accept: AcceptTransaction },
    NotarizeTransaction { transaction: OutboundTransaction },
    SendNymMessage { recipient: NymId, payload: String },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::RegisterNym => CommandKind::RegisterNym,
            Command::UnregisterNym => CommandKind::UnregisterNym,
            Command::GetRequestNumber => CommandKind::GetRequestNumber,
            Command::GetTransactionNumbers { .. } => CommandKind::GetTransactionNumbers,
            Command::RegisterAccount { .. } => CommandKind::RegisterAccount,
            Command::DeleteAccount { .. } => CommandKind::DeleteAccount,
            Command::GetNymbox => CommandKind::GetNymbox,
            Command::GetBoxReceipt { .. } => CommandKind::GetBoxReceipt,
            Command::ProcessNymbox { .. } => CommandKind::ProcessNymbox,
            Command::NotarizeTransaction { .. } => CommandKind::NotarizeTransaction,
            Command::SendNymMessage { .. } => CommandKind::SendNymMessage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_number: RequestNumber,
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    /// Local nymbox digest at the time the request was built
    pub nymbox_hash: NymboxDigest,
    pub command: Command,
    #[serde(default)]
    pub signature: Signature,
}

#[derive(Serialize)]
struct RequestSigningView<'a> {
    request_number: RequestNumber,
    nym_id: &'a NymId,
    notary_id: &'a NotaryId,
    nymbox_hash: &'a NymboxDigest,
    command: &'a Command,
}

impl Request {
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&RequestSigningView {
            request_number: self.request_number,
            nym_id: &self.nym_id,
            notary_id: &self.notary_id,
            nymbox_hash: &self.nymbox_hash,
            command: &self.command,
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}

/// Why a notary refused a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "camelCase")]
pub enum ReplyFailure {
    /// The request referenced a nymbox digest the notary no longer has
    StaleNymbox,
    /// The request number is not the one the notary expects next
    RequestNumberMismatch,
    Rejected(String),
}

/// Result of a notarized transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TransactionOutcome {
    /// Accepted; `closed` lists numbers the notary closed out as a result
    Accepted {
        #[serde(default)]
        closed: BTreeSet<TransactionNumber>,
    },
    /// Rejected; the number it was signed out under is burned
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ReplyBody {
    RegisterNym,
    UnregisterNym,
    GetRequestNumber {
        next: RequestNumber,
    },
    GetTransactionNumbers,
    RegisterAccount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<AccountId>,
    },
    DeleteAccount {
        account: AccountId,
    },
    GetNymbox {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nymbox: Option<Nymbox>,
    },
    GetBoxReceipt {
        item_id: ItemId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<BoxReceipt>,
    },
    ProcessNymbox {
        /// Entries the notary removed from the nymbox
        #[serde(default)]
        accepted: BTreeSet<ItemId>,
    },
    NotarizeTransaction {
        number: TransactionNumber,
        /// Absent when the request failed before the transaction was looked at
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<TransactionOutcome>,
    },
    SendNymMessage,
    /// A command this client does not know about
    #[serde(other)]
    Unknown,
}

impl ReplyBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            ReplyBody::RegisterNym => CommandKind::RegisterNym,
            ReplyBody::UnregisterNym => CommandKind::UnregisterNym,
            ReplyBody::GetRequestNumber { .. } => CommandKind::GetRequestNumber,
            ReplyBody::GetTransactionNumbers => CommandKind::GetTransactionNumbers,
            ReplyBody::RegisterAccount { .. } => CommandKind::RegisterAccount,
            ReplyBody::DeleteAccount { .. } => CommandKind::DeleteAccount,
            ReplyBody::GetNymbox { .. } => CommandKind::GetNymbox,
            ReplyBody::GetBoxReceipt { .. } => CommandKind::GetBoxReceipt,
            ReplyBody::ProcessNymbox { .. } => CommandKind::ProcessNymbox,
            ReplyBody::NotarizeTransaction { .. } => CommandKind::NotarizeTransaction,
            ReplyBody::SendNymMessage => CommandKind::SendNymMessage,
            ReplyBody::Unknown => CommandKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub request_number: RequestNumber,
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ReplyFailure>,
    /// Digest of the nymbox as the notary sees it after handling the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nymbox_hash: Option<NymboxDigest>,
    pub body: ReplyBody,
    #[serde(default)]
    pub signature: Signature,
}

#[derive(Serialize)]
struct ReplySigningView<'a> {
    request_number: RequestNumber,
    nym_id: &'a NymId,
    notary_id: &'a NotaryId,
    success: bool,
    failure: &'a Option<ReplyFailure>,
    nymbox_hash: &'a Option<NymboxDigest>,
    body: &'a ReplyBody,
}

impl Reply {
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes(&ReplySigningView {
            request_number: self.request_number,
            nym_id: &self.nym_id,
            notary_id: &self.notary_id,
            success: self.success,
            failure: &self.failure,
            nymbox_hash: &self.nymbox_hash,
            body: &self.body,
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }
}
