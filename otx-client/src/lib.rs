#![deny(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::too_many_lines)]

//! # Client-side consensus session for a notary
//!
//! A [`Session`] is the context one nym keeps with one notary. It knows
//! which transaction numbers the notary signed out to the nym, keeps a view
//! of the nym's nymbox and makes sure every notary reply is processed at
//! most once.
//!
//! ## Deliveries
//! Requests are handed to [`Session::queue`], which starts a delivery in the
//! background and returns a [`DeliveryFuture`]. The delivery sends the
//! request, and whenever the notary's nymbox digest differs from ours it
//! downloads the nymbox, fetches missing box receipts and accepts the
//! entries before resolving. Only one delivery runs per session at a time;
//! a second `queue` fails right away with [`SessionError::Busy`].
//!
//! ## Transaction numbers
//! Numbers arrive as tentative grants in the nymbox and become usable once
//! the notary confirms their acceptance. [`Session::next_transaction_number`]
//! hands one out as a [`ManagedNumber`], returned to the pool unless marked
//! as used.
//!
//! ## Persistence
//! The durable part of the state is written to a [`db::SessionStore`] after
//! every change and picked up again by [`SessionBuilder::build`].

pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatch;
mod error;
pub mod ledger;
pub mod reconcile;
mod session;
pub mod state;

pub use config::SessionConfig;
pub use delivery::{DeliveryFuture, DeliveryResult, DeliveryState, ReplyStatus};
pub use error::SessionError;
pub use ledger::{ManagedNumber, NumberLedger, NumberPurpose};
pub use session::{Session, SessionBuilder};
