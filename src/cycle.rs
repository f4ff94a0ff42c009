//! Running reward cycles.
//!
//! A cycle snapshots every player's score, allocates the reward pool, pays
//! each recipient on the ledger and then settles the paid scores in the
//! score store. At most one cycle runs per [CycleCoordinator] at a time.
//!
//! Only scores whose transfer succeeded are settled, so the score store
//! never loses points that were not paid for. Settling subtracts the
//! snapshotted score rather than zeroing it, so points a player earns while
//! a cycle is running carry over to the next one.
//!
//! A player whose transfer outcome or settlement is unknown is held: left out
//! of every later cycle until [CycleCoordinator::release_held] is called for
//! them.

pub mod builder;
pub mod report;

pub use builder::{CoordinatorBuildError, CycleCoordinatorBuilder};
pub use report::{CycleReport, ReconciliationIssue};

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    allocation::{
        allocate, Allocation, AllocationEntry, AllocationError,
        AllocationParams,
    },
    disburse::{
        Disbursement, DisbursementObserver, DisbursementReport, DisburseOptions,
        Disburser, FatalBatchError, ObserverError, Outcome,
    },
    journal::{
        CycleJournal, EntryState, JournalEntry, JournalError, JournalRecord,
    },
    ledger::Ledger,
    player::{Address, InputError, Snapshot},
    store::{ScoreStore, StoreError},
};

/// When scores are settled after a batch.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Settle every player whose transfer succeeded.
    #[default]
    PerEntry,
    /// Settle nobody unless every transfer in the batch succeeded.
    WholeBatch,
}

/// What a [CycleCoordinator] is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Idle,
    Snapshotting,
    Allocating,
    Disbursing,
    Reconciling,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Snapshotting => "snapshotting",
            Self::Allocating => "allocating",
            Self::Disbursing => "disbursing",
            Self::Reconciling => "reconciling",
        };

        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("a reward cycle is already {0}")]
    AlreadyRunning(CyclePhase),
    #[error("could not read scores")]
    Read(#[source] StoreError),
    #[error("invalid score snapshot")]
    Input(#[from] InputError),
    #[error("allocation failed")]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    FatalBatch(#[from] FatalBatchError),
    #[error("cycle journal unavailable")]
    Journal(#[from] JournalError),
    #[error("{0} is not held")]
    NotHeld(Address),
    #[error("could not settle score")]
    Settle(#[source] StoreError),
}

/// Runs reward cycles against a score store and a ledger.
///
/// Built with [CycleCoordinator::builder].
#[derive(Debug)]
pub struct CycleCoordinator {
    store: Arc<dyn ScoreStore>,
    ledger: Arc<dyn Ledger>,
    journal: Arc<dyn CycleJournal>,
    params: AllocationParams,
    decimals: u8,
    reset_policy: ResetPolicy,
    disburse_options: DisburseOptions,
    phase: Mutex<CyclePhase>,
    next_cycle_id: AtomicU64,
}

/// Exclusive hold on a coordinator for the length of one cycle. Dropping it
/// returns the coordinator to [CyclePhase::Idle], however the cycle ended.
struct CycleGuard<'a> {
    phase: &'a Mutex<CyclePhase>,
}

impl CycleGuard<'_> {
    fn advance(&self, next: CyclePhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        debug!(from = %*phase, to = %next, "cycle phase");
        *phase = next;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        *phase = CyclePhase::Idle;
    }
}

/// Records each entry's progress in the journal as the batch runs.
struct JournalProgress<'a> {
    journal: &'a dyn CycleJournal,
    record: &'a mut JournalRecord,
}

impl DisbursementObserver for JournalProgress<'_> {
    fn submitting(
        &mut self,
        entry: &AllocationEntry,
    ) -> Result<(), ObserverError> {
        self.record.mark(&entry.address, EntryState::Submitted);
        if let Err(e) = self.journal.store(self.record) {
            // Not sent after all.
            self.record.mark(&entry.address, EntryState::Pending);
            return Err(e.into());
        }

        Ok(())
    }

    fn settled(
        &mut self,
        disbursement: &Disbursement,
    ) -> Result<(), ObserverError> {
        let state = match &disbursement.outcome {
            Outcome::Success { tx } => EntryState::Confirmed(*tx),
            Outcome::Failed(reason) if reason.is_in_doubt() => {
                EntryState::Submitted
            }
            Outcome::Failed(reason) => EntryState::Failed(reason.to_string()),
        };
        self.record.mark(disbursement.address(), state);
        Ok(self.journal.store(self.record)?)
    }
}

impl CycleCoordinator {
    pub fn builder() -> CycleCoordinatorBuilder {
        CycleCoordinatorBuilder::new()
    }

    pub fn current_phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn params(&self) -> &AllocationParams {
        &self.params
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    /// Snapshots the score store and computes the allocation a cycle started
    /// now would pay, without paying it or changing any score.
    pub fn compute_allocation(&self) -> Result<Allocation, CycleError> {
        let snapshot = self.snapshot(&self.held_players()?)?;

        Ok(allocate(&snapshot, &self.params)?)
    }

    /// Players held after a transfer or settlement with an unknown outcome.
    pub fn held_players(&self) -> Result<Vec<JournalEntry>, CycleError> {
        Ok(self.journal.load()?.map(|r| r.held).unwrap_or_default())
    }

    /// Lets a held player back into reward cycles once an operator has
    /// checked what happened to their entry.
    ///
    /// Pass `settle` if the held score still has to be subtracted: the
    /// transfer landed on the ledger, or the score store shows the entry's
    /// points were never settled. Without it the points stay with the player
    /// and are paid for by a later cycle.
    ///
    /// If the journal cannot be written after settling, the player stays
    /// held and must be released again without `settle`.
    pub fn release_held(
        &self,
        address: &Address,
        settle: bool,
    ) -> Result<JournalEntry, CycleError> {
        let _guard = self.begin(CyclePhase::Reconciling)?;

        let mut record = self
            .journal
            .load()?
            .ok_or(CycleError::NotHeld(*address))?;
        let held = record
            .release(address)
            .ok_or(CycleError::NotHeld(*address))?;

        if settle {
            self.store
                .reset_score(address, held.entry.score)
                .map_err(CycleError::Settle)?;
        }
        self.save(&record)?;

        info!(
            %address,
            settle,
            reward = held.entry.reward,
            "released held player"
        );
        Ok(held)
    }

    /// Runs one full reward cycle.
    ///
    /// If the journal holds a cycle that an earlier run did not finish, that
    /// cycle is completed instead of starting a new one. Returns
    /// [CycleError::AlreadyRunning] immediately if another cycle is in
    /// progress on this coordinator.
    ///
    /// Failures of individual transfers do not fail the cycle. They are
    /// listed in the returned [CycleReport] and the affected scores are
    /// kept for the next cycle.
    pub fn run_distribution_cycle(&self) -> Result<CycleReport, CycleError> {
        let guard = self.begin(CyclePhase::Snapshotting)?;

        let held = match self.journal.load()? {
            Some(record) if record.is_open() => {
                return self.resume(&guard, record)
            }
            Some(record) => {
                let after = record.cycle_id.saturating_add(1);
                self.next_cycle_id.fetch_max(after, Ordering::SeqCst);
                record.held
            }
            None => vec![],
        };

        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::SeqCst);
        info!(cycle_id, pool = self.params.pool, "starting reward cycle");

        let snapshot = self.snapshot(&held)?;
        guard.advance(CyclePhase::Allocating);
        let allocation = allocate(&snapshot, &self.params)?;
        info!(
            cycle_id,
            players = snapshot.len(),
            recipients = allocation.len(),
            allocated = allocation.total(),
            "allocation computed"
        );

        if allocation.is_empty() {
            info!(cycle_id, "no scores to reward");
            let pool = allocation.pool;
            return Ok(CycleReport {
                held,
                ..CycleReport::empty(cycle_id, pool, self.decimals)
            });
        }

        guard.advance(CyclePhase::Disbursing);
        let mut record =
            JournalRecord::new(cycle_id, allocation.pool, allocation.entries());
        record.held = held;
        self.journal.store(&record)?;

        let paid = match self.pay(&mut record, allocation.entries()) {
            Ok(paid) => paid,
            Err(fatal) => {
                // Nothing was sent.
                record.close();
                if let Err(e) = self.save(&record) {
                    error!(cycle_id, error = ?e, "could not close cycle journal");
                }
                return Err(fatal.into());
            }
        };

        guard.advance(CyclePhase::Reconciling);
        let issues = self.reconcile(&mut record, &paid.disbursements);

        let report = CycleReport {
            unallocated: allocation.unallocated(),
            aborted: paid.aborted,
            ..CycleReport::empty(cycle_id, allocation.pool, self.decimals)
        };
        Ok(self.finish(record, report, paid.disbursements, issues))
    }

    /// Completes a cycle recorded in the journal by an earlier run.
    fn resume(
        &self,
        guard: &CycleGuard<'_>,
        mut record: JournalRecord,
    ) -> Result<CycleReport, CycleError> {
        let cycle_id = record.cycle_id;
        self.next_cycle_id
            .fetch_max(cycle_id.saturating_add(1), Ordering::SeqCst);

        let confirmed = record.confirmed();
        let settling = record.settling();
        let retry = record.retry_set();
        warn!(
            cycle_id,
            confirmed = confirmed.len(),
            in_doubt = record.in_doubt().len(),
            settling = settling.len(),
            retrying = retry.len(),
            "resuming unfinished reward cycle"
        );

        guard.advance(CyclePhase::Disbursing);
        // On a fatal error the journal is kept so that the next attempt
        // resumes again.
        let paid = if retry.is_empty() {
            DisbursementReport::default()
        } else {
            self.pay(&mut record, &retry)?
        };

        guard.advance(CyclePhase::Reconciling);
        let mut disbursements: Vec<Disbursement> = confirmed
            .into_iter()
            .map(|(entry, tx)| Disbursement {
                entry,
                outcome: Outcome::Success { tx },
            })
            .collect();
        disbursements.extend(paid.disbursements);

        let mut issues: Vec<ReconciliationIssue> = settling
            .into_iter()
            .map(|entry| {
                error!(
                    cycle_id,
                    address = %entry.address,
                    score = entry.score,
                    "paid score may not have been settled; check the score store"
                );
                ReconciliationIssue::SettlementUnknown { entry }
            })
            .collect();
        issues.extend(self.reconcile(&mut record, &disbursements));

        let report = CycleReport {
            resumed: true,
            unallocated: record.pool.saturating_sub(record.total()),
            aborted: paid.aborted,
            ..CycleReport::empty(cycle_id, record.pool, self.decimals)
        };
        Ok(self.finish(record, report, disbursements, issues))
    }

    fn begin(&self, initial: CyclePhase) -> Result<CycleGuard<'_>, CycleError> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase != CyclePhase::Idle {
            warn!(phase = %*phase, "reward cycle already running");
            return Err(CycleError::AlreadyRunning(*phase));
        }
        *phase = initial;

        Ok(CycleGuard { phase: &self.phase })
    }

    /// Reads every score, leaving out the `held` players.
    fn snapshot(&self, held: &[JournalEntry]) -> Result<Snapshot, CycleError> {
        let players = self.store.read_all_scores().map_err(|e| {
            error!(error = %e, "could not read scores");
            CycleError::Read(e)
        })?;
        let snapshot = Snapshot::new(players)?;

        if held.is_empty() {
            return Ok(snapshot);
        }
        let excluded: HashSet<Address> =
            held.iter().map(|h| h.entry.address).collect();
        debug!(held = excluded.len(), "leaving held players out of the cycle");

        Ok(snapshot.excluding(&excluded))
    }

    /// Stores `record`, or clears the journal if nothing is left in it.
    fn save(&self, record: &JournalRecord) -> Result<(), JournalError> {
        if record.is_finished() {
            self.journal.clear()
        } else {
            self.journal.store(record)
        }
    }

    fn pay(
        &self,
        record: &mut JournalRecord,
        entries: &[AllocationEntry],
    ) -> Result<DisbursementReport, FatalBatchError> {
        let mut progress = JournalProgress {
            journal: &*self.journal,
            record,
        };

        Disburser::new(&*self.ledger, self.disburse_options)
            .disburse_observed(entries, &mut progress)
    }

    /// Settles the score of every successful disbursement, as allowed by the
    /// reset policy. Each entry is marked [EntryState::Settling] in the
    /// journal while its score is reset; an entry left in that state is held.
    fn reconcile(
        &self,
        record: &mut JournalRecord,
        disbursements: &[Disbursement],
    ) -> Vec<ReconciliationIssue> {
        let cycle_id = record.cycle_id;
        let all_succeeded = disbursements.iter().all(|d| d.outcome.is_success())
            && record.in_doubt().is_empty();
        if self.reset_policy == ResetPolicy::WholeBatch && !all_succeeded {
            warn!(
                cycle_id,
                "not every transfer succeeded, keeping every score under whole-batch policy"
            );
            return vec![];
        }

        let mut issues = vec![];
        for d in disbursements.iter().filter(|d| d.outcome.is_success()) {
            let AllocationEntry { address, score, .. } = d.entry;

            record.mark(&address, EntryState::Settling);
            if let Err(e) = self.journal.store(record) {
                error!(cycle_id, error = ?e, "could not record settlement start");
                issues.push(ReconciliationIssue::JournalWrite {
                    error: e.to_string(),
                });
            }

            if let Err(e) = self.store.reset_score(&address, score) {
                error!(
                    cycle_id,
                    %address,
                    reward = d.reward(),
                    error = %e,
                    "reward paid but score not settled; holding player"
                );
                issues.push(ReconciliationIssue::ResetFailed {
                    address,
                    settled: score,
                    error: e.to_string(),
                });
                continue;
            }

            record.mark(&address, EntryState::Settled);
            if let Err(e) = self.journal.store(record) {
                error!(cycle_id, error = ?e, "could not record settled score");
                issues.push(ReconciliationIssue::JournalWrite {
                    error: e.to_string(),
                });
            }
        }

        issues
    }

    /// Closes the cycle in the journal, holding every player whose entry is
    /// in doubt, and completes the report.
    fn finish(
        &self,
        mut record: JournalRecord,
        report: CycleReport,
        disbursements: Vec<Disbursement>,
        mut issues: Vec<ReconciliationIssue>,
    ) -> CycleReport {
        let cycle_id = report.cycle_id;

        for entry in record.in_doubt() {
            error!(
                cycle_id,
                address = %entry.address,
                reward = entry.reward,
                "transfer outcome unknown; holding player until released"
            );
            issues.push(ReconciliationIssue::UnknownTransferState { entry });
        }

        record.close();
        if let Err(e) = self.save(&record) {
            error!(cycle_id, error = ?e, "could not close cycle journal");
            issues.push(ReconciliationIssue::JournalWrite {
                error: e.to_string(),
            });
        }

        let mut report = report.with_disbursements(disbursements);
        report.reconciliation_issues = issues;
        report.held = record.held;

        if report.is_clean() {
            info!(
                cycle_id,
                paid = report.succeeded.len(),
                distributed = report.total_distributed,
                "reward cycle complete"
            );
        } else {
            warn!(
                cycle_id,
                paid = report.succeeded.len(),
                failed = report.failed.len(),
                issues = report.reconciliation_issues.len(),
                held = report.held.len(),
                distributed = report.total_distributed,
                "reward cycle complete with failures"
            );
        }

        report
    }
}
