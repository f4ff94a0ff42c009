/*!
Re-export of common values and datatypes used for running reward cycles.
Must be imported manually.

```
use score_rewards::prelude::*;
```
*/

use crate::{
    allocation, config, cycle, disburse, journal, ledger, player, store, units,
};

pub use allocation::{
    allocate, Allocation, AllocationEntry, AllocationError, AllocationParams,
    RoundingPolicy,
};

pub use config::{ConfigError, RewardConfig};

pub use cycle::{
    CoordinatorBuildError, CycleCoordinator, CycleCoordinatorBuilder,
    CycleError, CyclePhase, CycleReport, ReconciliationIssue, ResetPolicy,
};

pub use disburse::{
    DisburseOptions, Disbursement, DisbursementReport, Disburser,
    FailureReason, FatalBatchError, Outcome,
};

pub use journal::{
    CycleJournal, EntryState, FileJournal, JournalEntry, MemoryJournal,
};

pub use ledger::{Ledger, LedgerError, SimulatedLedger, TxHash};

pub use player::{Address, InputError, PlayerScore, Score, Snapshot};

pub use store::{InMemoryScoreStore, ScoreStore, StoreError};

pub use units::{format_units, parse_units, TokenAmount};
