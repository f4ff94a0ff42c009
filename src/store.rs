//! The persistent player score table that reward cycles read from and
//! settle against.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use crate::player::{Address, PlayerScore, Score};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("score store unavailable: {0}")]
    Unavailable(String),
    #[error("no score recorded for {0}")]
    UnknownPlayer(Address),
}

/// Storage for accumulated player scores.
pub trait ScoreStore: Debug + Send + Sync {
    /// Reads every player's score as one consistent, point-in-time result
    /// set.
    fn read_all_scores(&self) -> Result<Vec<PlayerScore>, StoreError>;

    /// Marks `settled` points of `address`'s score as paid out. Points
    /// recorded after the snapshot that `settled` came from are kept, so a
    /// player with no concurrent activity is left with a score of zero.
    fn reset_score(
        &self,
        address: &Address,
        settled: Score,
    ) -> Result<(), StoreError>;
}

/// A [ScoreStore] held in memory.
#[derive(Debug, Default)]
pub struct InMemoryScoreStore {
    scores: RwLock<BTreeMap<Address, Score>>,
    reads_unavailable: AtomicBool,
    failing_resets: RwLock<HashSet<Address>>,
}

impl InMemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given scores.
    pub fn with_scores<I>(scores: I) -> Self
    where
        I: IntoIterator<Item = PlayerScore>,
    {
        let store = Self::new();
        for PlayerScore { address, score } in scores {
            store.record_score(address, score);
        }

        store
    }

    /// Adds `points` to `address`'s score, creating the player if needed.
    /// Returns the new score.
    pub fn record_score(&self, address: Address, points: Score) -> Score {
        let mut scores = self.scores.write().unwrap_or_else(|e| e.into_inner());
        let score = scores.entry(address).or_default();
        *score = score.saturating_add(points);

        *score
    }

    pub fn score_of(&self, address: &Address) -> Option<Score> {
        self.scores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
    }

    /// Makes [ScoreStore::read_all_scores] fail until called again with
    /// `false`.
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        self.reads_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes [ScoreStore::reset_score] fail for `address`.
    pub fn fail_resets_for(&self, address: Address) {
        self.failing_resets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address);
    }
}

impl ScoreStore for InMemoryScoreStore {
    fn read_all_scores(&self) -> Result<Vec<PlayerScore>, StoreError> {
        if self.reads_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }

        let scores = self.scores.read().unwrap_or_else(|e| e.into_inner());
        Ok(scores
            .iter()
            .map(|(&address, &score)| PlayerScore { address, score })
            .collect())
    }

    fn reset_score(
        &self,
        address: &Address,
        settled: Score,
    ) -> Result<(), StoreError> {
        if self
            .failing_resets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
        {
            return Err(StoreError::Unavailable(format!(
                "write to {} failed",
                address
            )));
        }

        let mut scores = self.scores.write().unwrap_or_else(|e| e.into_inner());
        match scores.get_mut(address) {
            Some(score) => {
                *score = score.saturating_sub(settled);
                Ok(())
            }
            None => Err(StoreError::UnknownPlayer(*address)),
        }
    }
}
