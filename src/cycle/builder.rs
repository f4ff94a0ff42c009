use std::{
    num::NonZeroUsize,
    sync::{atomic::AtomicU64, Arc, Mutex},
    time::Duration,
};

use crate::{
    allocation::{AllocationParams, RoundingPolicy},
    config::RewardConfig,
    disburse::DisburseOptions,
    journal::{CycleJournal, FileJournal, MemoryJournal},
    ledger::Ledger,
    store::ScoreStore,
    units::{parse_units, TokenAmount, UnitsError, MAX_DECIMALS},
};

use super::{CycleCoordinator, CyclePhase, ResetPolicy};

#[derive(Debug, Clone)]
enum PoolSize {
    Units(TokenAmount),
    Display(String),
}

/// Builds a [CycleCoordinator].
#[derive(Debug, Default)]
pub struct CycleCoordinatorBuilder {
    store: Option<Arc<dyn ScoreStore>>,
    ledger: Option<Arc<dyn Ledger>>,
    journal: Option<Arc<dyn CycleJournal>>,
    pool: Option<PoolSize>,
    decimals: Option<u8>,
    rounding: RoundingPolicy,
    reset_policy: ResetPolicy,
    max_recipients: Option<NonZeroUsize>,
    confirmation_timeout: Option<Duration>,
    first_cycle_id: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorBuildError {
    #[error("no score store was given")]
    NoScoreStore,
    #[error("no ledger was given")]
    NoLedger,
    #[error("no reward pool was given")]
    NoPool,
    #[error("token decimals must be at most 38, got {0}")]
    TooManyDecimals(u8),
    #[error("confirmation timeout must be greater than 0")]
    ZeroTimeout,
    #[error("cycle ids start at 1")]
    ZeroCycleId,
    #[error("invalid pool amount")]
    Pool(#[from] UnitsError),
}

impl CycleCoordinatorBuilder {
    /// Creates a new [CycleCoordinatorBuilder].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with every setting taken from `config`. The score
    /// store and ledger still have to be given.
    pub fn from_config(config: &RewardConfig) -> Self {
        let mut builder = Self::new()
            .with_pool(&config.pool)
            .with_decimals(config.decimals)
            .with_rounding(config.rounding)
            .with_reset_policy(config.reset_policy)
            .with_max_recipients(config.max_recipients())
            .with_confirmation_timeout(config.confirmation_timeout());

        if let Some(path) = &config.journal_path {
            builder = builder.with_journal(Arc::new(FileJournal::new(path)));
        }

        builder
    }

    /// Sets the store that scores are read from and settled in.
    pub fn with_store<S: ScoreStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);

        self
    }

    /// Sets the ledger that rewards are paid on.
    pub fn with_ledger<L: Ledger + 'static>(mut self, ledger: Arc<L>) -> Self {
        self.ledger = Some(ledger);

        self
    }

    /// Sets the journal used to resume interrupted cycles and to hold
    /// in-doubt transfers ([MemoryJournal] used otherwise).
    pub fn with_journal<J: CycleJournal + 'static>(
        mut self,
        journal: Arc<J>,
    ) -> Self {
        self.journal = Some(journal);

        self
    }

    /// Sets the pool size in smallest token units.
    pub fn with_pool_units(mut self, pool: TokenAmount) -> Self {
        self.pool = Some(PoolSize::Units(pool));

        self
    }

    /// Sets the pool size in display units, e.g. `"1000"` or `"0.5"`. The
    /// amount is scaled by the token's decimals when the coordinator is
    /// built.
    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(PoolSize::Display(pool.to_owned()));

        self
    }

    /// Sets the decimal places of the reward token (default 18).
    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = Some(decimals);

        self
    }

    pub fn with_rounding(mut self, rounding: RoundingPolicy) -> Self {
        self.rounding = rounding;

        self
    }

    pub fn with_reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.reset_policy = policy;

        self
    }

    /// Only the highest-ranked `max` players are paid each cycle. `None`
    /// (the default) pays every player with a score.
    pub fn with_max_recipients(mut self, max: Option<NonZeroUsize>) -> Self {
        self.max_recipients = max;

        self
    }

    /// Sets the longest wait for a single transfer's receipt (default 120
    /// seconds).
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);

        self
    }

    /// Sets the id of the first cycle run (default 1). A journal holding a
    /// later cycle moves the numbering past it.
    pub fn with_first_cycle_id(mut self, id: u64) -> Self {
        self.first_cycle_id = Some(id);

        self
    }

    /// Creates a [CycleCoordinator] from the specified parameters.
    pub fn build(self) -> Result<CycleCoordinator, CoordinatorBuildError> {
        use CoordinatorBuildError::*;

        let CycleCoordinatorBuilder {
            store,
            ledger,
            journal,
            pool,
            decimals,
            rounding,
            reset_policy,
            max_recipients,
            confirmation_timeout,
            first_cycle_id,
        } = self;

        let store = store.ok_or(NoScoreStore)?;
        let ledger = ledger.ok_or(NoLedger)?;
        let journal =
            journal.unwrap_or_else(|| Arc::new(MemoryJournal::new()));

        let decimals = decimals.unwrap_or(18);
        if decimals > MAX_DECIMALS {
            return Err(TooManyDecimals(decimals));
        }
        let pool = match pool {
            Some(PoolSize::Units(units)) => units,
            Some(PoolSize::Display(amount)) => parse_units(&amount, decimals)?,
            None => return Err(NoPool),
        };

        let disburse_options = match confirmation_timeout {
            Some(timeout) if timeout.is_zero() => return Err(ZeroTimeout),
            Some(confirmation_timeout) => DisburseOptions {
                confirmation_timeout,
            },
            None => DisburseOptions::default(),
        };

        let first_cycle_id = match first_cycle_id {
            Some(0) => return Err(ZeroCycleId),
            Some(id) => id,
            None => 1,
        };

        let params = AllocationParams::new(pool)
            .with_rounding(rounding)
            .with_max_recipients(max_recipients);

        Ok(CycleCoordinator {
            store,
            ledger,
            journal,
            params,
            decimals,
            reset_policy,
            disburse_options,
            phase: Mutex::new(CyclePhase::Idle),
            next_cycle_id: AtomicU64::new(first_cycle_id),
        })
    }
}
