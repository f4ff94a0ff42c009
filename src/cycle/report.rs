use std::fmt;

use serde::Serialize;

use crate::{
    allocation::AllocationEntry,
    disburse::{Disbursement, Outcome},
    journal::{EntryState, JournalEntry},
    player::{Address, Score},
    units::{format_units, TokenAmount},
};

/// Something that needs an operator after a cycle has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationIssue {
    /// The reward was paid but the score could not be settled, so the
    /// player would be paid for the same points again next cycle.
    ResetFailed {
        address: Address,
        settled: Score,
        error: String,
    },
    /// A transfer was submitted but its outcome is unknown. The player is
    /// held until an operator has checked the ledger.
    UnknownTransferState { entry: AllocationEntry },
    /// A paid score was being settled when the process stopped. The player
    /// is held until an operator has checked the score store.
    SettlementUnknown { entry: AllocationEntry },
    /// Progress could not be written to the cycle journal.
    JournalWrite { error: String },
}

impl fmt::Display for ReconciliationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetFailed {
                address,
                settled,
                error,
            } => write!(
                f,
                "paid {} but could not settle {} points: {}",
                address, settled, error
            ),
            Self::UnknownTransferState { entry } => write!(
                f,
                "transfer of {} units to {} has an unknown outcome",
                entry.reward, entry.address
            ),
            Self::SettlementUnknown { entry } => write!(
                f,
                "{} was paid {} units but may not have been settled",
                entry.address, entry.reward
            ),
            Self::JournalWrite { error } => {
                write!(f, "journal write failed: {}", error)
            }
        }
    }
}

/// Everything that happened during one reward cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    /// True if the cycle was picked up from the journal of an earlier run.
    pub resumed: bool,
    pub pool: TokenAmount,
    /// Decimal places used when displaying amounts.
    pub decimals: u8,
    pub total_distributed: TokenAmount,
    /// Part of the pool not allocated to anyone because of rounding.
    pub unallocated: TokenAmount,
    pub succeeded: Vec<Disbursement>,
    pub failed: Vec<Disbursement>,
    /// Set if a fatal ledger error stopped the batch part way through.
    pub aborted: Option<String>,
    pub reconciliation_issues: Vec<ReconciliationIssue>,
    /// Players left out of cycles until an operator releases them, including
    /// any held by this cycle.
    pub held: Vec<JournalEntry>,
}

impl CycleReport {
    /// A report for a cycle that paid nobody.
    pub(crate) fn empty(
        cycle_id: u64,
        pool: TokenAmount,
        decimals: u8,
    ) -> Self {
        CycleReport {
            cycle_id,
            resumed: false,
            pool,
            decimals,
            total_distributed: 0,
            unallocated: pool,
            succeeded: vec![],
            failed: vec![],
            aborted: None,
            reconciliation_issues: vec![],
            held: vec![],
        }
    }

    /// Sorts `disbursements` into [CycleReport::succeeded] and
    /// [CycleReport::failed] and recomputes the distributed total.
    pub(crate) fn with_disbursements(
        mut self,
        disbursements: Vec<Disbursement>,
    ) -> Self {
        let (succeeded, failed): (Vec<_>, Vec<_>) = disbursements
            .into_iter()
            .partition(|d| d.outcome.is_success());

        self.total_distributed = succeeded.iter().map(|d| d.reward()).sum();
        self.succeeded = succeeded;
        self.failed = failed;

        self
    }

    /// True if every transfer succeeded and nothing needs an operator.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.aborted.is_none()
            && self.reconciliation_issues.is_empty()
            && self.held.is_empty()
    }

    /// Number of players the cycle tried to pay.
    pub fn recipients(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let amount = |units| format_units(units, self.decimals);

        writeln!(
            f,
            "Cycle {}{}: distributed {} of {} ({} unallocated)",
            self.cycle_id,
            if self.resumed { " (resumed)" } else { "" },
            amount(self.total_distributed),
            amount(self.pool),
            amount(self.unallocated),
        )?;
        writeln!(
            f,
            "{} paid, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )?;

        for d in self.succeeded.iter().chain(&self.failed) {
            let status = match &d.outcome {
                Outcome::Success { tx: Some(tx) } => format!("paid    {}", tx),
                Outcome::Success { tx: None } => "paid    (nothing sent)".into(),
                Outcome::Failed(reason) => format!("FAILED  {}", reason),
            };
            writeln!(
                f,
                "  {}  {:>12} pts  {:>24}  {}",
                d.address(),
                d.entry.score,
                amount(d.reward()),
                status
            )?;
        }

        if let Some(reason) = &self.aborted {
            writeln!(f, "Batch aborted: {}", reason)?;
        }
        for issue in &self.reconciliation_issues {
            writeln!(f, "Needs reconciliation: {}", issue)?;
        }
        for h in &self.held {
            let why = match h.state {
                EntryState::Settling => "settlement unknown",
                _ => "transfer unknown",
            };
            writeln!(
                f,
                "Held: {}  {:>24}  {}",
                h.entry.address,
                amount(h.entry.reward),
                why
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disburse::FailureReason, player::tests::addr};

    fn disbursement(a: u8, reward: TokenAmount, ok: bool) -> Disbursement {
        Disbursement {
            entry: AllocationEntry {
                address: addr(a),
                score: 1,
                reward,
            },
            outcome: if ok {
                Outcome::Success { tx: None }
            } else {
                Outcome::Failed(FailureReason::Rejected("nonce".into()))
            },
        }
    }

    #[test]
    fn partitions_outcomes() {
        let report = CycleReport::empty(1, 1000, 0).with_disbursements(vec![
            disbursement(1, 600, true),
            disbursement(2, 300, false),
            disbursement(3, 100, true),
        ]);

        assert_eq!(report.total_distributed, 700);
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.recipients(), 3);
        assert!(!report.is_clean());
    }

    #[test]
    fn display_uses_token_units() {
        let report = CycleReport::empty(4, 1_500_000, 6)
            .with_disbursements(vec![disbursement(1, 1_250_000, true)]);
        let text = report.to_string();

        assert!(text.starts_with("Cycle 4: distributed 1.25 of 1.5"));
        assert!(text.contains("1 paid, 0 failed"));
        assert!(report.is_clean());
    }

    #[test]
    fn held_players_need_an_operator() {
        let mut report = CycleReport::empty(2, 100, 0)
            .with_disbursements(vec![disbursement(1, 60, true)]);
        assert!(report.is_clean());

        report.held.push(JournalEntry {
            entry: AllocationEntry {
                address: addr(2),
                score: 4,
                reward: 40,
            },
            state: EntryState::Submitted,
        });

        assert!(!report.is_clean());
        assert!(report.to_string().contains(&format!(
            "Held: {}",
            addr(2)
        )));
    }
}
