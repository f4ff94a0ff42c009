//! Reward cycle settings loaded from TOML.
//!
//! ```toml
//! pool = "1000"
//! decimals = 18
//! max_recipients = 100
//! rounding = "floor"
//! reset_policy = "per_entry"
//! confirmation_timeout_secs = 120
//! journal_path = "reward-cycle.journal.json"
//! ```

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    allocation::{AllocationParams, RoundingPolicy},
    cycle::ResetPolicy,
    units::{parse_units, TokenAmount, UnitsError},
};

fn default_pool() -> String {
    "1000".into()
}

fn default_decimals() -> u8 {
    18
}

fn default_max_recipients() -> usize {
    100
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

/// Settings for a reward cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardConfig {
    /// Pool size in display units, e.g. `"1000"` or `"12.5"`.
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Decimal places of the reward token.
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    /// Only the top `max_recipients` players are paid; 0 means everyone.
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default)]
    pub rounding: RoundingPolicy,
    #[serde(default)]
    pub reset_policy: ResetPolicy,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Where in-flight cycles are journaled. No journal is kept if unset.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

impl Default for RewardConfig {
    fn default() -> Self {
        RewardConfig {
            pool: default_pool(),
            decimals: default_decimals(),
            max_recipients: default_max_recipients(),
            rounding: RoundingPolicy::default(),
            reset_policy: ResetPolicy::default(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            journal_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config")]
    Parse(#[from] toml::de::Error),
    #[error("invalid pool amount")]
    Pool(#[from] UnitsError),
    #[error("confirmation timeout must be greater than 0")]
    ZeroTimeout,
}

impl RewardConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;

        Self::from_toml_str(&content)
    }

    /// Checks every field that can be invalid on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool_units()?;
        if self.confirmation_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }

    /// The pool in smallest token units.
    pub fn pool_units(&self) -> Result<TokenAmount, UnitsError> {
        parse_units(&self.pool, self.decimals)
    }

    pub fn max_recipients(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_recipients)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn allocation_params(&self) -> Result<AllocationParams, ConfigError> {
        Ok(AllocationParams::new(self.pool_units()?)
            .with_rounding(self.rounding)
            .with_max_recipients(self.max_recipients()))
    }
}
