//! Runs reward cycles against simulated players and a simulated ledger.
//!
//! ```text
//! reward_cycle [config.toml]
//! ```
//!
//! Set `RUST_LOG` to change the log level (default `info`).

use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use score_rewards::prelude::*;

const PLAYERS: u8 = 12;
const SEED: u64 = 2024;

fn main() -> Result<()> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match env::args().nth(1) {
        Some(path) => RewardConfig::load(&path)
            .with_context(|| format!("loading {}", path))?,
        None => RewardConfig {
            confirmation_timeout_secs: 1,
            ..RewardConfig::default()
        },
    };

    let mut rng = StdRng::seed_from_u64(SEED);
    let store = Arc::new(InMemoryScoreStore::new());
    for n in 1..=PLAYERS {
        let player = Address::from_bytes([n; 20]);
        store.record_score(player, rng.gen_range(0..5_000));
    }

    let pool = config.pool_units()?;
    let ledger = Arc::new(
        SimulatedLedger::new(Address::from_bytes([0xff; 20]), pool.saturating_mul(2))
            .with_failure_rate(0.2, SEED)
            .with_receipt_delay(Duration::from_millis(5)),
    );

    let coordinator = CycleCoordinatorBuilder::from_config(&config)
        .with_store(store.clone())
        .with_ledger(ledger)
        .build()?;

    let preview = coordinator.compute_allocation()?;
    println!(
        "Allocating {} of {} to {} players",
        format_units(preview.total(), config.decimals),
        config.pool,
        preview.len()
    );

    let report = coordinator.run_distribution_cycle()?;
    println!("{}", report);

    // Unpaid players keep their score, and new points are added on top.
    for n in 1..=PLAYERS {
        let player = Address::from_bytes([n; 20]);
        store.record_score(player, rng.gen_range(0..500));
    }
    let report = coordinator.run_distribution_cycle()?;
    println!("{}", report);

    Ok(())
}
