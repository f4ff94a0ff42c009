//! Definitions for the ledger that rewards are paid out on.
//!
//! A [Ledger] is bound to a single signing account and exposes the four
//! steps of a token transfer: a preflight check of the signer and endpoint,
//! gas estimation, submission, and a bounded wait for the receipt.

pub mod simulated;

pub use simulated::SimulatedLedger;

use std::{
    fmt::{self, Debug},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{player::Address, units::TokenAmount};

/// Hash identifying a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        TxHash(bytes)
    }
}

impl From<[u8; 32]> for TxHash {
    fn from(value: [u8; 32]) -> Self {
        TxHash(value)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(serde::de::Error::custom)?;

        Ok(TxHash(bytes))
    }
}

/// Final state of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Confirmed,
    Reverted,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx: TxHash,
    pub status: TxStatus,
    pub block_number: u64,
    pub gas_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("signing credential rejected: {0}")]
    InvalidCredential(String),
    #[error("ledger endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("gas estimation failed: {0}")]
    GasEstimation(String),
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("no receipt within {0:?}")]
    Timeout(Duration),
}

impl LedgerError {
    /// Returns true if no further transfer can succeed with this ledger
    /// client, as opposed to a failure scoped to a single transfer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredential(_) | Self::Unreachable(_))
    }
}

/// A client for a token contract, bound to one signing account.
///
/// Transfers from one signer are sequenced by nonce, so callers must not
/// submit a transfer before the previous one has been settled.
pub trait Ledger: Debug + Send + Sync {
    /// Address of the signing account that rewards are paid from.
    fn signer(&self) -> Address;

    /// Verifies that the credential is usable and the endpoint reachable.
    fn preflight(&self) -> Result<(), LedgerError>;

    /// Estimates the gas needed to transfer `amount` to `to`.
    fn estimate_transfer(
        &self,
        to: &Address,
        amount: TokenAmount,
    ) -> Result<u64, LedgerError>;

    /// Signs and submits a transfer of `amount` to `to`.
    fn submit_transfer(
        &self,
        to: &Address,
        amount: TokenAmount,
    ) -> Result<TxHash, LedgerError>;

    /// Waits at most `timeout` for the receipt of `tx`. Implementations must
    /// return [LedgerError::Timeout] rather than block past `timeout`.
    fn wait_for_receipt(
        &self,
        tx: &TxHash,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LedgerError, TxHash};

    #[test]
    fn fatal_errors() {
        assert!(LedgerError::InvalidCredential("bad key".into()).is_fatal());
        assert!(LedgerError::Unreachable("refused".into()).is_fatal());
        assert!(!LedgerError::Rejected("nonce".into()).is_fatal());
        assert!(!LedgerError::GasEstimation("revert".into()).is_fatal());
        assert!(!LedgerError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn tx_hash_serde_round_trip() {
        let tx = TxHash::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.starts_with("\"0xabab"));
        assert_eq!(serde_json::from_str::<TxHash>(&json).unwrap(), tx);
    }
}
