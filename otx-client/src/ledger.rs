//! Transaction number accounting
//!
//! A nym may only use numbers the notary signed out to it. Numbers move
//! through the sets kept here:
//!
//! ```text
//!   nymbox grant ──add_tentative──▶ tentative ──accept_issued──▶ issued ∩ available
//!                                                                   │
//!                          allocate (in-flight) ◀───────────────────┘
//!                          consume_issued (closed by a receipt)
//!                          recover_available (failed server-side)
//! ```
//!
//! `highest` only ever grows; a number at or below it is never admitted
//! again, which is what turns a replayed server statement into a no-op.
//!
//! Numbers handed out through a [`ManagedNumber`] are tracked as allocated
//! until the handle goes away, and only the handle may return them.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools as _;
use otx_core::TransactionNumber;
use otx_core::statement::TransactionStatement;
use otx_logging::LOG_CLIENT_LEDGER;
use strum::Display;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::state::SharedState;

/// What an allocated number is going to be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NumberPurpose {
    /// Closing an item already sitting in a box; may use the last number
    CloseBoxItem,
    /// Anything else; has to leave the configured reserve untouched
    Transact,
}

/// Result of [`NumberLedger::update_highest`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighestUpdate {
    /// Candidates above the previous highest number
    pub good: BTreeSet<TransactionNumber>,
    /// Candidates at or below it, rejected as replays
    pub bad: BTreeSet<TransactionNumber>,
    /// Lowest rejected candidate, zero if none was rejected
    pub violator: TransactionNumber,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumberLedger {
    highest: TransactionNumber,
    issued: BTreeSet<TransactionNumber>,
    available: BTreeSet<TransactionNumber>,
    tentative: BTreeSet<TransactionNumber>,
    /// Held by a live handle, not persisted
    allocated: BTreeSet<TransactionNumber>,
    reserve: usize,
    /// Bumped on every change to the persisted sets
    revision: u64,
}

impl NumberLedger {
    pub fn new(reserve: usize) -> Self {
        Self {
            reserve,
            ..Self::default()
        }
    }

    /// Rebuild from persisted sets
    ///
    /// Sets that break the ledger invariants are repaired rather than
    /// rejected: stray available numbers are dropped, tentative numbers that
    /// are already issued stop being tentative.
    pub fn from_parts(
        highest: TransactionNumber,
        issued: BTreeSet<TransactionNumber>,
        available: BTreeSet<TransactionNumber>,
        tentative: BTreeSet<TransactionNumber>,
        reserve: usize,
    ) -> Self {
        let available: BTreeSet<_> = available.intersection(&issued).copied().collect();
        let tentative: BTreeSet<_> = tentative
            .into_iter()
            .filter(|n| *n != 0 && !issued.contains(n))
            .collect();
        let ledger = Self {
            highest,
            issued,
            available,
            tentative,
            allocated: BTreeSet::new(),
            reserve,
            revision: 0,
        };
        ledger.debug_check();
        ledger
    }

    pub fn highest(&self) -> TransactionNumber {
        self.highest
    }

    pub fn issued(&self) -> &BTreeSet<TransactionNumber> {
        &self.issued
    }

    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    pub fn tentative(&self) -> &BTreeSet<TransactionNumber> {
        &self.tentative
    }

    /// Changes whenever `highest` or one of the persisted sets changes
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn is_issued(&self, number: TransactionNumber) -> bool {
        self.issued.contains(&number)
    }

    pub fn is_tentative(&self, number: TransactionNumber) -> bool {
        self.tentative.contains(&number)
    }

    fn reserve_for(&self, purpose: NumberPurpose) -> usize {
        match purpose {
            NumberPurpose::CloseBoxItem => 0,
            NumberPurpose::Transact => self.reserve,
        }
    }

    /// Take the lowest available number, if the reserve allows it
    pub fn allocate(&mut self, purpose: NumberPurpose) -> Option<TransactionNumber> {
        if self.available.len() <= self.reserve_for(purpose) {
            debug!(
                target: LOG_CLIENT_LEDGER,
                %purpose,
                available = self.available.len(),
                "Not enough available transaction numbers"
            );
            return None;
        }

        let number = self.available.pop_first()?;
        self.touch();
        trace!(target: LOG_CLIENT_LEDGER, number, %purpose, "Allocated transaction number");
        self.debug_check();
        Some(number)
    }

    /// Take a number for a [`ManagedNumber`], which has to hand it back
    /// through [`Self::release`]
    pub(crate) fn allocate_managed(&mut self, purpose: NumberPurpose) -> Option<TransactionNumber> {
        let number = self.allocate(purpose)?;
        self.allocated.insert(number);
        Some(number)
    }

    pub fn is_allocated(&self, number: TransactionNumber) -> bool {
        self.allocated.contains(&number)
    }

    /// Whether `number` could still be admitted as a new number
    pub(crate) fn check_new(&self, number: TransactionNumber) -> Result<(), SessionError> {
        if number == 0 || number <= self.highest {
            return Err(SessionError::Replay {
                number,
                highest: self.highest,
            });
        }
        Ok(())
    }

    /// Remember a number offered by the notary until its grant is confirmed
    pub fn add_tentative(&mut self, number: TransactionNumber) -> bool {
        if let Err(err) = self.check_new(number) {
            warn!(target: LOG_CLIENT_LEDGER, %err, "Ignoring tentative number");
            return false;
        }
        if self.issued.contains(&number) || !self.tentative.insert(number) {
            trace!(target: LOG_CLIENT_LEDGER, number, "Number already known");
            return false;
        }
        self.touch();
        trace!(target: LOG_CLIENT_LEDGER, number, "Added tentative number");
        true
    }

    /// Drop a tentative number whose grant was not confirmed
    pub fn remove_tentative(&mut self, number: TransactionNumber) -> bool {
        let removed = self.tentative.remove(&number);
        if removed {
            self.touch();
        }
        removed
    }

    /// Promote a single tentative number into the issued set
    pub fn accept_issued(&mut self, number: TransactionNumber) -> bool {
        self.accept_issued_numbers(&BTreeSet::from([number]))
    }

    /// Promote every tentative number of a counterpart statement
    ///
    /// Returns whether all numbers the statement offers were accepted.
    pub fn accept_issued_statement(&mut self, statement: &TransactionStatement) -> bool {
        let offered: BTreeSet<_> = statement
            .issued
            .iter()
            .copied()
            .filter(|n| !self.issued.contains(n))
            .collect();
        self.accept_issued_numbers(&offered)
    }

    /// Promote `numbers` from tentative to issued and available
    ///
    /// Numbers that are not tentative are ignored, numbers at or below the
    /// highest seen are dropped from tentative as replays. Returns whether
    /// every one of `numbers` ended up issued.
    pub fn accept_issued_numbers(&mut self, numbers: &BTreeSet<TransactionNumber>) -> bool {
        let candidates: BTreeSet<_> = numbers
            .iter()
            .copied()
            .filter(|n| self.tentative.contains(n))
            .collect();
        if candidates.is_empty() {
            return numbers.is_empty();
        }

        let HighestUpdate { good, bad, violator } = self.update_highest(&candidates);
        if !bad.is_empty() {
            warn!(
                target: LOG_CLIENT_LEDGER,
                violator,
                rejected = %bad.iter().join(","),
                "Dropping tentative numbers at or below the highest number"
            );
        }
        for number in &candidates {
            self.tentative.remove(number);
        }
        for number in &good {
            self.issued.insert(*number);
            self.available.insert(*number);
        }
        self.touch();
        debug!(
            target: LOG_CLIENT_LEDGER,
            accepted = good.len(),
            highest = self.highest,
            "Accepted issued numbers"
        );
        self.debug_check();

        good.len() == numbers.len()
    }

    /// Split candidates into new numbers and replays, raising `highest`
    pub fn update_highest(&mut self, candidates: &BTreeSet<TransactionNumber>) -> HighestUpdate {
        let previous = self.highest;
        let (good, bad): (BTreeSet<_>, BTreeSet<_>) = candidates
            .iter()
            .copied()
            .partition(|n| *n != 0 && *n > previous);

        if let Some(max) = good.last() {
            self.highest = *max;
            self.touch();
        }
        let violator = bad.first().copied().unwrap_or(0);
        HighestUpdate { good, bad, violator }
    }

    /// Make a number usable again after its operation failed server-side
    ///
    /// A number missing from the issued set is only admitted if it is above
    /// the highest seen, like any new number. A number still held by a
    /// [`ManagedNumber`] is left to its handle.
    pub fn recover_available(&mut self, number: TransactionNumber) -> bool {
        if self.allocated.contains(&number) {
            trace!(target: LOG_CLIENT_LEDGER, number, "Number is still allocated, not recovering");
            return false;
        }
        if !self.issued.contains(&number) {
            if let Err(err) = self.check_new(number) {
                warn!(target: LOG_CLIENT_LEDGER, %err, "Refusing to recover a number that is not issued");
                return false;
            }
            self.update_highest(&BTreeSet::from([number]));
            self.tentative.remove(&number);
            self.issued.insert(number);
            self.touch();
        }
        let recovered = self.available.insert(number);
        if recovered {
            self.touch();
            debug!(target: LOG_CLIENT_LEDGER, number, "Recovered transaction number");
        }
        self.debug_check();
        recovered
    }

    /// Forget a number the notary has permanently closed
    pub fn consume_issued(&mut self, number: TransactionNumber) -> bool {
        let was_available = self.available.remove(&number);
        let consumed = self.issued.remove(&number);
        if consumed || was_available {
            self.touch();
        }
        if consumed {
            debug!(target: LOG_CLIENT_LEDGER, number, "Closed transaction number");
        } else {
            trace!(target: LOG_CLIENT_LEDGER, number, "Number to close was not issued");
        }
        consumed
    }

    /// Hand back a number taken through [`Self::allocate_managed`]
    ///
    /// An unused number goes back to the available set, unless it got closed
    /// while it was allocated. Returns whether it became available again.
    pub(crate) fn release(&mut self, number: TransactionNumber, used: bool) -> bool {
        self.allocated.remove(&number);
        if used || !self.issued.contains(&number) || !self.available.insert(number) {
            return false;
        }
        self.touch();
        true
    }

    /// Align the issued set with one asserted by the notary
    ///
    /// Local numbers the notary no longer lists are closed. Listed numbers
    /// unknown locally go through [`Self::update_highest`], so a stale
    /// assertion can never resurrect a number. Returns whether every
    /// offered number was admitted.
    pub fn resync(
        &mut self,
        issued: &BTreeSet<TransactionNumber>,
        available: &BTreeSet<TransactionNumber>,
    ) -> bool {
        let dropped: Vec<_> = self.issued.difference(issued).copied().collect();
        for number in dropped {
            self.consume_issued(number);
        }

        let offered: BTreeSet<_> = issued.difference(&self.issued).copied().collect();
        if offered.is_empty() {
            return true;
        }
        let HighestUpdate { good, bad, violator } = self.update_highest(&offered);
        if !bad.is_empty() {
            warn!(
                target: LOG_CLIENT_LEDGER,
                violator,
                rejected = %bad.iter().join(","),
                "Resync offered numbers at or below the highest number"
            );
        }
        for number in &good {
            self.tentative.remove(number);
            self.issued.insert(*number);
            if available.contains(number) {
                self.available.insert(*number);
            }
        }
        self.touch();
        self.debug_check();
        bad.is_empty()
    }

    /// Current sets adjusted by pending additions and removals
    pub fn statement_sets(
        &self,
        adding: &BTreeSet<TransactionNumber>,
        without: &BTreeSet<TransactionNumber>,
    ) -> (BTreeSet<TransactionNumber>, BTreeSet<TransactionNumber>) {
        let issued = self
            .issued
            .union(adding)
            .copied()
            .filter(|n| !without.contains(n))
            .collect();
        let available = self
            .available
            .union(adding)
            .copied()
            .filter(|n| !without.contains(n))
            .collect();
        (issued, available)
    }

    /// Drop every number; used when the nym unregisters
    pub fn clear(&mut self) {
        self.issued.clear();
        self.available.clear();
        self.tentative.clear();
        self.allocated.clear();
        self.touch();
    }

    pub fn invariants_hold(&self) -> bool {
        self.available.is_subset(&self.issued)
            && self.tentative.is_disjoint(&self.issued)
            && !self.tentative.contains(&0)
            && !self.issued.contains(&0)
    }

    fn debug_check(&self) {
        debug_assert!(self.invariants_hold(), "number ledger invariant broken: {self:?}");
    }
}

/// A number drawn from the available set
///
/// Unless [`Self::set_success`] is called, dropping the handle hands the
/// number back to the available set, provided it is still issued.
#[derive(Debug)]
pub struct ManagedNumber {
    shared: Arc<SharedState>,
    number: TransactionNumber,
    success: bool,
}

impl ManagedNumber {
    pub(crate) fn allocate(shared: &Arc<SharedState>, purpose: NumberPurpose) -> Option<Self> {
        let number = shared.update(|state| state.numbers.allocate_managed(purpose))?;
        Some(Self {
            shared: shared.clone(),
            number,
            success: false,
        })
    }

    pub fn value(&self) -> TransactionNumber {
        self.number
    }

    /// Mark whether the number was used up (`true`) or should be returned
    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

impl Drop for ManagedNumber {
    fn drop(&mut self) {
        let number = self.number;
        let used = self.success;
        let released = self.shared.update(|state| state.numbers.release(number, used));
        trace!(target: LOG_CLIENT_LEDGER, number, used, released, "Released transaction number");
    }
}
