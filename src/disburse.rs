//! Paying out an allocation on a [Ledger], one transfer per recipient.
//!
//! Transfers are strictly sequential: each one is settled (confirmed,
//! reverted, refused, or timed out) before the next is submitted, which keeps
//! the signer's nonces in order. A failure of one transfer is recorded and
//! the batch moves on. Only a fatal ledger error (unusable credential or
//! unreachable endpoint) stops the batch, in which case every entry not yet
//! settled is recorded as aborted. If that error arrives while waiting for
//! the receipt of a transfer that was already submitted, that transfer is
//! recorded as [FailureReason::Unconfirmed] instead: it may have landed.

use std::{error::Error, time::Duration, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    allocation::AllocationEntry,
    ledger::{Ledger, LedgerError, TxHash, TxStatus},
    player::Address,
    units::TokenAmount,
};

/// Default bound on the wait for a single transfer's receipt.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a single transfer did not go through.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error,
)]
pub enum FailureReason {
    #[error("gas estimation failed: {0}")]
    GasEstimation(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("no receipt within {0:?}")]
    Timeout(Duration),
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    #[error("not attempted, batch aborted: {0}")]
    Aborted(String),
    /// Submitted, then the ledger became unusable before the outcome was
    /// known. The transfer may or may not have landed.
    #[error("submitted as {tx} but outcome unknown: {error}")]
    Unconfirmed { tx: TxHash, error: String },
}

impl FailureReason {
    /// Returns true if the transfer may have landed on the ledger, so it
    /// must not be sent again without checking.
    pub fn is_in_doubt(&self) -> bool {
        matches!(self, Self::Unconfirmed { .. })
    }
}

impl From<LedgerError> for FailureReason {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::GasEstimation(msg) => Self::GasEstimation(msg),
            LedgerError::Rejected(msg) => Self::Rejected(msg),
            LedgerError::Timeout(after) => Self::Timeout(after),
            fatal @ (LedgerError::InvalidCredential(_)
            | LedgerError::Unreachable(_)) => Self::Aborted(fatal.to_string()),
        }
    }
}

/// Result of paying a single [AllocationEntry].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Paid. `tx` is `None` for zero-amount entries, which are not sent.
    Success { tx: Option<TxHash> },
    Failed(FailureReason),
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// An allocation entry together with what happened when paying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disbursement {
    pub entry: AllocationEntry,
    pub outcome: Outcome,
}

impl Disbursement {
    #[inline]
    pub fn address(&self) -> &Address {
        &self.entry.address
    }

    #[inline]
    pub fn reward(&self) -> TokenAmount {
        self.entry.reward
    }
}

/// Outcome of every entry passed to [Disburser::disburse], in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementReport {
    pub disbursements: Vec<Disbursement>,
    /// Set if a fatal ledger error stopped the batch part way through.
    pub aborted: Option<String>,
}

impl DisbursementReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &Disbursement> {
        self.disbursements.iter().filter(|d| d.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Disbursement> {
        self.disbursements.iter().filter(|d| !d.outcome.is_success())
    }

    /// Sum of all successfully transferred rewards.
    pub fn total_distributed(&self) -> TokenAmount {
        self.succeeded().map(|d| d.reward()).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.disbursements.iter().all(|d| d.outcome.is_success())
    }
}

/// The ledger could not be used at all; no transfer was attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("disbursement aborted before any transfer: {0}")]
pub struct FatalBatchError(#[from] pub LedgerError);

/// A fatal ledger error, with the transaction that was in flight when it
/// happened.
struct Fatal {
    error: LedgerError,
    in_flight: Option<TxHash>,
}

/// Error returned by a [DisbursementObserver] to stop the batch.
pub type ObserverError = Box<dyn Error + Send + Sync>;

/// Receives progress of a batch as it happens.
pub trait DisbursementObserver {
    /// Called right before a transfer for `entry` is submitted. Returning an
    /// error aborts the batch before that transfer.
    fn submitting(
        &mut self,
        _entry: &AllocationEntry,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Called once the outcome of an entry is known.
    fn settled(
        &mut self,
        _disbursement: &Disbursement,
    ) -> Result<(), ObserverError> {
        Ok(())
    }
}

impl DisbursementObserver for () {}

/// Options for a [Disburser].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisburseOptions {
    /// Longest time to wait for any single receipt.
    pub confirmation_timeout: Duration,
}

impl Default for DisburseOptions {
    fn default() -> Self {
        DisburseOptions {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

/// Applies allocations to a [Ledger].
#[derive(Debug)]
pub struct Disburser<'a, L: Ledger + ?Sized> {
    ledger: &'a L,
    options: DisburseOptions,
}

impl<'a, L: Ledger + ?Sized> Disburser<'a, L> {
    pub fn new(ledger: &'a L, options: DisburseOptions) -> Self {
        Disburser { ledger, options }
    }

    /// Pays every entry, in order.
    pub fn disburse(
        &self,
        entries: &[AllocationEntry],
    ) -> Result<DisbursementReport, FatalBatchError> {
        self.disburse_observed(entries, &mut ())
    }

    /// Pays every entry, in order, reporting progress to `observer`.
    ///
    /// Returns [FatalBatchError] only if the ledger fails its preflight
    /// check, in which case nothing was sent.
    pub fn disburse_observed(
        &self,
        entries: &[AllocationEntry],
        observer: &mut dyn DisbursementObserver,
    ) -> Result<DisbursementReport, FatalBatchError> {
        if let Err(e) = self.ledger.preflight() {
            if e.is_fatal() {
                error!(error = %e, "ledger preflight failed");
                return Err(FatalBatchError(e));
            }
            warn!(error = %e, "ledger preflight reported a non-fatal error");
        }

        let mut report = DisbursementReport {
            disbursements: Vec::with_capacity(entries.len()),
            aborted: None,
        };

        for (i, entry) in entries.iter().enumerate() {
            let outcome = if entry.reward == 0 {
                debug!(to = %entry.address, "skipping zero-amount entry");
                Outcome::Success { tx: None }
            } else {
                if let Err(e) = observer.submitting(entry) {
                    let reason = format!("progress could not be recorded: {}", e);
                    error!(to = %entry.address, %reason, "aborting disbursement");
                    report.abort(&entries[i..], reason);
                    return Ok(report);
                }

                match self.pay(entry) {
                    Ok(outcome) => outcome,
                    Err(Fatal {
                        error,
                        in_flight: None,
                    }) => {
                        error!(to = %entry.address, %error, "aborting disbursement");
                        report.abort(&entries[i..], error.to_string());
                        return Ok(report);
                    }
                    Err(Fatal {
                        error,
                        in_flight: Some(tx),
                    }) => {
                        error!(
                            to = %entry.address,
                            %tx,
                            %error,
                            "ledger lost while awaiting receipt, aborting disbursement"
                        );
                        let disbursement = Disbursement {
                            entry: *entry,
                            outcome: Outcome::Failed(FailureReason::Unconfirmed {
                                tx,
                                error: error.to_string(),
                            }),
                        };
                        if let Err(e) = observer.settled(&disbursement) {
                            error!(to = %entry.address, error = %e, "progress could not be recorded");
                        }
                        report.disbursements.push(disbursement);
                        report.abort(&entries[i + 1..], error.to_string());
                        return Ok(report);
                    }
                }
            };

            let disbursement = Disbursement {
                entry: *entry,
                outcome,
            };

            if let Err(e) = observer.settled(&disbursement) {
                let reason = format!("progress could not be recorded: {}", e);
                error!(to = %entry.address, %reason, "aborting disbursement");
                report.disbursements.push(disbursement);
                report.abort(&entries[i + 1..], reason);
                return Ok(report);
            }
            report.disbursements.push(disbursement);
        }

        Ok(report)
    }

    /// Runs one transfer to completion. Errors are fatal to the batch;
    /// failures of this transfer alone are returned as [Outcome::Failed].
    fn pay(&self, entry: &AllocationEntry) -> Result<Outcome, Fatal> {
        let to = &entry.address;
        let amount = entry.reward;

        let failed = |e: LedgerError, in_flight| -> Result<Outcome, Fatal> {
            if e.is_fatal() {
                return Err(Fatal {
                    error: e,
                    in_flight,
                });
            }
            warn!(%to, amount, error = %e, "transfer failed");
            Ok(Outcome::Failed(e.into()))
        };

        let gas = match self.ledger.estimate_transfer(to, amount) {
            Ok(gas) => gas,
            Err(e) => return failed(e, None),
        };
        let tx = match self.ledger.submit_transfer(to, amount) {
            Ok(tx) => tx,
            Err(e) => return failed(e, None),
        };
        debug!(%to, amount, gas, %tx, "transfer submitted");

        let timeout = self.options.confirmation_timeout;
        let started = Instant::now();
        let receipt = match self.ledger.wait_for_receipt(&tx, timeout) {
            Ok(receipt) => receipt,
            Err(e) => return failed(e, Some(tx)),
        };
        if started.elapsed() > timeout {
            warn!(%tx, ?timeout, "ledger returned a receipt after the timeout");
        }

        match receipt.status {
            TxStatus::Confirmed => {
                debug!(%to, amount, %tx, block = receipt.block_number, "transfer confirmed");
                Ok(Outcome::Success { tx: Some(tx) })
            }
            TxStatus::Reverted => {
                warn!(%to, amount, %tx, "transfer reverted");
                Ok(Outcome::Failed(FailureReason::Reverted(tx)))
            }
        }
    }
}

impl DisbursementReport {
    fn abort(&mut self, remaining: &[AllocationEntry], reason: String) {
        self.disbursements
            .extend(remaining.iter().map(|entry| Disbursement {
                entry: *entry,
                outcome: Outcome::Failed(FailureReason::Aborted(reason.clone())),
            }));
        self.aborted = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        ledger::simulated::{FailureMode, SimulatedLedger},
        player::tests::addr,
    };

    const OPTIONS: DisburseOptions = DisburseOptions {
        confirmation_timeout: Duration::from_millis(20),
    };

    fn entry(a: u8, reward: TokenAmount) -> AllocationEntry {
        AllocationEntry {
            address: addr(a),
            score: reward as u64,
            reward,
        }
    }

    fn outcomes(report: &DisbursementReport) -> Vec<(Address, bool)> {
        report
            .disbursements
            .iter()
            .map(|d| (*d.address(), d.outcome.is_success()))
            .collect()
    }

    #[test]
    fn pays_every_entry_in_order() {
        let ledger = SimulatedLedger::new(addr(0xff), 1000);
        let entries = [entry(3, 600), entry(2, 300), entry(1, 100)];

        let report = Disburser::new(&ledger, OPTIONS).disburse(&entries).unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.total_distributed(), 1000);
        assert_eq!(ledger.balance_of(&addr(3)), 600);
        assert_eq!(ledger.treasury(), 0);
    }

    #[test]
    fn one_failure_does_not_stop_the_batch() {
        let ledger = SimulatedLedger::new(addr(0xff), 1000)
            .failing_for(addr(2), FailureMode::Reject);
        let entries = [entry(1, 100), entry(2, 300), entry(3, 600)];

        let report = Disburser::new(&ledger, OPTIONS).disburse(&entries).unwrap();

        assert_eq!(
            outcomes(&report),
            vec![(addr(1), true), (addr(2), false), (addr(3), true)]
        );
        assert_eq!(report.total_distributed(), 700);
        assert!(report.aborted.is_none());
    }

    #[test]
    fn each_failure_kind_is_recorded() {
        let ledger = SimulatedLedger::new(addr(0xff), 1000)
            .failing_for(addr(1), FailureMode::GasEstimation)
            .failing_for(addr(2), FailureMode::Revert)
            .failing_for(addr(3), FailureMode::Timeout);
        let entries = [entry(1, 1), entry(2, 1), entry(3, 1)];

        let report = Disburser::new(&ledger, OPTIONS).disburse(&entries).unwrap();
        let reasons: Vec<_> = report
            .disbursements
            .iter()
            .map(|d| d.outcome.clone())
            .collect();

        assert!(matches!(
            reasons[0],
            Outcome::Failed(FailureReason::GasEstimation(_))
        ));
        assert!(matches!(
            reasons[1],
            Outcome::Failed(FailureReason::Reverted(_))
        ));
        assert_eq!(
            reasons[2],
            Outcome::Failed(FailureReason::Timeout(OPTIONS.confirmation_timeout))
        );
    }

    #[test]
    fn zero_amounts_are_skipped() {
        let ledger = SimulatedLedger::new(addr(0xff), 10);
        let report = Disburser::new(&ledger, OPTIONS)
            .disburse(&[entry(1, 0), entry(2, 5)])
            .unwrap();

        assert_eq!(ledger.submissions(), 1);
        assert_eq!(
            report.disbursements[0].outcome,
            Outcome::Success { tx: None }
        );
        assert!(report.all_succeeded());
    }

    #[test]
    fn failed_preflight_sends_nothing() {
        let ledger = SimulatedLedger::new(addr(0xff), 10).with_preflight_error(
            LedgerError::InvalidCredential("bad key".into()),
        );

        let err = Disburser::new(&ledger, OPTIONS)
            .disburse(&[entry(1, 5)])
            .unwrap_err();

        assert_eq!(
            err,
            FatalBatchError(LedgerError::InvalidCredential("bad key".into()))
        );
        assert_eq!(ledger.submissions(), 0);
    }

    #[test]
    fn fatal_error_mid_batch_aborts_remainder() {
        let ledger = SimulatedLedger::new(addr(0xff), 100).unreachable_after(1);
        let entries = [entry(1, 10), entry(2, 10), entry(3, 10)];

        let report = Disburser::new(&ledger, OPTIONS).disburse(&entries).unwrap();

        assert_eq!(
            outcomes(&report),
            vec![(addr(1), true), (addr(2), false), (addr(3), false)]
        );
        assert!(report.aborted.is_some());
        assert!(matches!(
            report.disbursements[2].outcome,
            Outcome::Failed(FailureReason::Aborted(_))
        ));
    }

    #[test]
    fn fatal_error_after_submission_is_in_doubt() {
        let ledger = SimulatedLedger::new(addr(0xff), 100)
            .failing_for(addr(2), FailureMode::LostReceipt);
        let entries = [entry(1, 10), entry(2, 20), entry(3, 30)];
        let mut recorder = Recorder::default();

        let report = Disburser::new(&ledger, OPTIONS)
            .disburse_observed(&entries, &mut recorder)
            .unwrap();

        assert_eq!(ledger.balance_of(&addr(2)), 20);
        match &report.disbursements[1].outcome {
            Outcome::Failed(reason) => {
                assert!(reason.is_in_doubt());
                assert!(matches!(reason, FailureReason::Unconfirmed { .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            report.disbursements[2].outcome,
            Outcome::Failed(FailureReason::Aborted(_))
        ));
        assert!(report.aborted.is_some());
        assert_eq!(recorder.settled, vec![addr(1), addr(2)]);
        assert_eq!(ledger.submissions(), 2);
    }

    #[derive(Default)]
    struct Recorder {
        submitted: Vec<Address>,
        settled: Vec<Address>,
        refuse_after: Option<usize>,
    }

    impl DisbursementObserver for Recorder {
        fn submitting(
            &mut self,
            entry: &AllocationEntry,
        ) -> Result<(), ObserverError> {
            if self.refuse_after == Some(self.submitted.len()) {
                return Err("disk full".into());
            }
            self.submitted.push(entry.address);
            Ok(())
        }

        fn settled(&mut self, d: &Disbursement) -> Result<(), ObserverError> {
            self.settled.push(*d.address());
            Ok(())
        }
    }

    #[test]
    fn observer_sees_progress() {
        let ledger = SimulatedLedger::new(addr(0xff), 100);
        let mut recorder = Recorder::default();

        Disburser::new(&ledger, OPTIONS)
            .disburse_observed(&[entry(1, 0), entry(2, 5)], &mut recorder)
            .unwrap();

        assert_eq!(recorder.submitted, vec![addr(2)]);
        assert_eq!(recorder.settled, vec![addr(1), addr(2)]);
    }

    #[test]
    fn observer_error_stops_before_transfer() {
        let ledger = SimulatedLedger::new(addr(0xff), 100);
        let mut recorder = Recorder {
            refuse_after: Some(1),
            ..Default::default()
        };

        let report = Disburser::new(&ledger, OPTIONS)
            .disburse_observed(&[entry(1, 5), entry(2, 5)], &mut recorder)
            .unwrap();

        assert_eq!(ledger.submissions(), 1);
        assert_eq!(
            outcomes(&report),
            vec![(addr(1), true), (addr(2), false)]
        );
        assert!(report.aborted.unwrap().contains("disk full"));
    }
}
