//! The nymbox: a per-nym inbox of system notices maintained by the notary
//!
//! A downloaded [`Nymbox`] only carries abbreviated [`NymboxEntry`] headers;
//! the full content of every entry is a [`BoxReceipt`] that has to be
//! fetched separately.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::message::Reply;
use crate::statement::TransactionStatement;
use crate::{ItemId, NymId, NymboxDigest, RequestNumber, TransactionNumber, canonical_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
pub enum NymboxItemKind {
    /// Peer message sent by another nym
    Message,
    /// Notice carrying a payment instrument (cheque, invoice, cash)
    InstrumentNotice,
    /// Generic notary notice
    Notice,
    /// Confirms that previously accepted numbers were signed out
    SuccessNotice,
    /// Copy of a reply the notary sent for one of our requests
    ReplyNotice,
    /// Grant of fresh transaction numbers
    BlankNumbers,
    /// A recurring obligation closed, releasing its numbers
    FinalReceipt,
}

/// Abbreviated header of one nymbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NymboxEntry {
    pub item_id: ItemId,
    pub kind: NymboxItemKind,
    /// Request the entry refers to; only set for reply notices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_number: Option<RequestNumber>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nymbox {
    pub entries: Vec<NymboxEntry>,
}

impl Nymbox {
    pub fn new(entries: Vec<NymboxEntry>) -> Self {
        Self { entries }
    }

    /// Digest agreed on by client and notary
    pub fn digest(&self) -> NymboxDigest {
        NymboxDigest::hash(&canonical_bytes(&self.entries))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, item_id: ItemId) -> Option<&NymboxEntry> {
        self.entries.iter().find(|entry| entry.item_id == item_id)
    }

    /// Drop entries by id, keeping the order of the rest
    pub fn remove(&mut self, item_ids: &BTreeSet<ItemId>) {
        self.entries.retain(|entry| !item_ids.contains(&entry.item_id));
    }
}

/// Full content of a nymbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BoxReceipt {
    Message {
        sender: NymId,
        payload: String,
    },
    InstrumentNotice {
        sender: NymId,
        instrument: String,
    },
    Notice {
        text: String,
    },
    SuccessNotice {
        numbers: BTreeSet<TransactionNumber>,
    },
    ReplyNotice {
        request_number: RequestNumber,
        /// The original reply, if the notary attached it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<Box<Reply>>,
    },
    BlankNumbers {
        numbers: BTreeSet<TransactionNumber>,
    },
    FinalReceipt {
        closing: BTreeSet<TransactionNumber>,
    },
}

impl BoxReceipt {
    pub fn kind(&self) -> NymboxItemKind {
        match self {
            BoxReceipt::Message { .. } => NymboxItemKind::Message,
            BoxReceipt::InstrumentNotice { .. } => NymboxItemKind::InstrumentNotice,
            BoxReceipt::Notice { .. } => NymboxItemKind::Notice,
            BoxReceipt::SuccessNotice { .. } => NymboxItemKind::SuccessNotice,
            BoxReceipt::ReplyNotice { .. } => NymboxItemKind::ReplyNotice,
            BoxReceipt::BlankNumbers { .. } => NymboxItemKind::BlankNumbers,
            BoxReceipt::FinalReceipt { .. } => NymboxItemKind::FinalReceipt,
        }
    }
}

/// One accept sub-item of a process-nymbox transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AcceptItem {
    AcceptMessage {
        item_id: ItemId,
    },
    AcceptNotice {
        item_id: ItemId,
    },
    /// Accept (a subset of) the numbers offered by a blank-numbers entry
    AcceptNumbers {
        item_id: ItemId,
        numbers: BTreeSet<TransactionNumber>,
    },
    AcceptFinalReceipt {
        item_id: ItemId,
        closing: BTreeSet<TransactionNumber>,
    },
}

impl AcceptItem {
    pub fn item_id(&self) -> ItemId {
        match self {
            AcceptItem::AcceptMessage { item_id }
            | AcceptItem::AcceptNotice { item_id }
            | AcceptItem::AcceptNumbers { item_id, .. }
            | AcceptItem::AcceptFinalReceipt { item_id, .. } => *item_id,
        }
    }
}

/// The combined accept submitted to clear a nymbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptTransaction {
    pub items: Vec<AcceptItem>,
    /// Issued numbers after the accept takes effect
    pub statement: TransactionStatement,
}

impl AcceptTransaction {
    pub fn item_ids(&self) -> BTreeSet<ItemId> {
        self.items.iter().map(AcceptItem::item_id).collect()
    }

    /// Numbers this accept signs out from blank-numbers entries
    pub fn accepted_numbers(&self) -> BTreeSet<TransactionNumber> {
        self.items
            .iter()
            .filter_map(|item| match item {
                AcceptItem::AcceptNumbers { numbers, .. } => Some(numbers.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}
