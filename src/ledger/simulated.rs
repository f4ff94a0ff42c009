//! An in-memory [Ledger] holding token balances, with scripted and random
//! transfer failures. Useful for tests and dry runs.

use std::{
    collections::HashMap,
    sync::Mutex,
    thread,
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{player::Address, units::TokenAmount};

use super::{Ledger, LedgerError, Receipt, TxHash, TxStatus};

/// Gas charged by [SimulatedLedger] for every transfer.
pub const TRANSFER_GAS: u64 = 51_000;

/// How a scripted failure for a recipient manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Gas estimation reverts.
    GasEstimation,
    /// The transfer is refused on submission.
    Reject,
    /// The transfer is mined but reverts.
    Revert,
    /// The receipt never arrives.
    Timeout,
    /// The transfer is mined, but the endpoint becomes unreachable while
    /// waiting for its receipt.
    LostReceipt,
}

#[derive(Debug)]
struct State {
    treasury: TokenAmount,
    balances: HashMap<Address, TokenAmount>,
    pending: HashMap<TxHash, (Address, TokenAmount, Option<FailureMode>)>,
    nonce: u64,
    block_number: u64,
    submissions: usize,
    rng: StdRng,
}

/// Simulated token contract paying out of a single treasury account.
#[derive(Debug)]
pub struct SimulatedLedger {
    signer: Address,
    state: Mutex<State>,
    failures: HashMap<Address, FailureMode>,
    failure_rate: f64,
    preflight_error: Option<LedgerError>,
    unreachable_after: Option<usize>,
    receipt_delay: Duration,
}

impl SimulatedLedger {
    /// Creates a ledger whose signer holds `treasury` units.
    pub fn new(signer: Address, treasury: TokenAmount) -> Self {
        SimulatedLedger {
            signer,
            state: Mutex::new(State {
                treasury,
                balances: HashMap::new(),
                pending: HashMap::new(),
                nonce: 0,
                block_number: 0,
                submissions: 0,
                rng: StdRng::from_entropy(),
            }),
            failures: HashMap::new(),
            failure_rate: 0.0,
            preflight_error: None,
            unreachable_after: None,
            receipt_delay: Duration::ZERO,
        }
    }

    /// Every transfer to `recipient` fails as described by `mode`.
    pub fn failing_for(mut self, recipient: Address, mode: FailureMode) -> Self {
        self.failures.insert(recipient, mode);

        self
    }

    /// Each transfer is independently refused with probability `rate`.
    ///
    /// ## Panics
    /// Panics if `rate` is not between 0 and 1.
    pub fn with_failure_rate(mut self, rate: f64, seed: u64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "rate must be between 0 and 1");
        self.failure_rate = rate;
        self.state.get_mut().unwrap_or_else(|e| e.into_inner()).rng =
            StdRng::seed_from_u64(seed);

        self
    }

    /// [Ledger::preflight] fails with `error`.
    pub fn with_preflight_error(mut self, error: LedgerError) -> Self {
        self.preflight_error = Some(error);

        self
    }

    /// The endpoint becomes unreachable after `n` submissions.
    pub fn unreachable_after(mut self, n: usize) -> Self {
        self.unreachable_after = Some(n);

        self
    }

    /// Receipts take `delay` to arrive.
    pub fn with_receipt_delay(mut self, delay: Duration) -> Self {
        self.receipt_delay = delay;

        self
    }

    /// Balance credited to `address` so far.
    pub fn balance_of(&self, address: &Address) -> TokenAmount {
        self.lock().balances.get(address).copied().unwrap_or(0)
    }

    /// Units remaining in the signer's treasury.
    pub fn treasury(&self) -> TokenAmount {
        self.lock().treasury
    }

    /// Number of transfers submitted so far, successful or not.
    pub fn submissions(&self) -> usize {
        self.lock().submissions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scripted(&self, to: &Address) -> Option<FailureMode> {
        self.failures.get(to).copied()
    }
}

impl Ledger for SimulatedLedger {
    fn signer(&self) -> Address {
        self.signer
    }

    fn preflight(&self) -> Result<(), LedgerError> {
        match &self.preflight_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn estimate_transfer(
        &self,
        to: &Address,
        _amount: TokenAmount,
    ) -> Result<u64, LedgerError> {
        match self.scripted(to) {
            Some(FailureMode::GasEstimation) => Err(LedgerError::GasEstimation(
                format!("execution reverted for {}", to),
            )),
            _ => Ok(TRANSFER_GAS),
        }
    }

    fn submit_transfer(
        &self,
        to: &Address,
        amount: TokenAmount,
    ) -> Result<TxHash, LedgerError> {
        let mut state = self.lock();

        if let Some(limit) = self.unreachable_after {
            if state.submissions >= limit {
                return Err(LedgerError::Unreachable(
                    "connection refused".into(),
                ));
            }
        }
        state.submissions += 1;

        let scripted = self.scripted(to);
        if scripted == Some(FailureMode::Reject)
            || (self.failure_rate > 0.0
                && state.rng.gen_bool(self.failure_rate))
        {
            return Err(LedgerError::Rejected(format!(
                "transfer to {} refused by node",
                to
            )));
        }

        state.nonce += 1;
        let mut bytes = [0u8; 32];
        bytes[..20].copy_from_slice(self.signer.as_bytes());
        bytes[24..].copy_from_slice(&state.nonce.to_be_bytes());
        let tx = TxHash::from_bytes(bytes);

        state.pending.insert(tx, (*to, amount, scripted));

        Ok(tx)
    }

    fn wait_for_receipt(
        &self,
        tx: &TxHash,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError> {
        let pending = self.lock().pending.remove(tx);
        let (to, amount, scripted) = match pending {
            Some(pending) => pending,
            None => {
                return Err(LedgerError::Rejected(format!(
                    "unknown transaction {}",
                    tx
                )))
            }
        };

        if scripted == Some(FailureMode::Timeout)
            || self.receipt_delay > timeout
        {
            thread::sleep(timeout.min(self.receipt_delay));
            return Err(LedgerError::Timeout(timeout));
        }
        thread::sleep(self.receipt_delay);

        let mut state = self.lock();
        state.block_number += 1;

        let status = if scripted == Some(FailureMode::Revert)
            || state.treasury < amount
        {
            TxStatus::Reverted
        } else {
            state.treasury -= amount;
            *state.balances.entry(to).or_default() += amount;
            TxStatus::Confirmed
        };

        if scripted == Some(FailureMode::LostReceipt) {
            return Err(LedgerError::Unreachable("socket closed".into()));
        }

        Ok(Receipt {
            tx: *tx,
            status,
            block_number: state.block_number,
            gas_used: TRANSFER_GAS,
        })
    }
}
