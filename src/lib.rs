/*!
Converts accumulated game scores into proportional shares of a fixed token
reward pool and pays them out on a ledger.

A reward cycle is run by a [cycle::CycleCoordinator]:

1. every player's score is read from a [store::ScoreStore] as one snapshot,
2. the pool is split between players in proportion to their scores
   ([allocation::allocate]),
3. each reward is transferred on a [ledger::Ledger], one at a time
   ([disburse::Disburser]),
4. the scores of players who were paid are settled in the store.

Players whose transfer failed keep their score for the next cycle.

```
use std::sync::Arc;

use score_rewards::prelude::*;

let player: Address = "0x00000000000000000000000000000000000000aa".parse()?;
let store = Arc::new(InMemoryScoreStore::new());
store.record_score(player, 40);

let signer = Address::from_bytes([0xff; 20]);
let ledger = Arc::new(SimulatedLedger::new(signer, 1_000));
let coordinator = CycleCoordinator::builder()
    .with_store(store.clone())
    .with_ledger(ledger.clone())
    .with_pool_units(1_000)
    .build()?;

let report = coordinator.run_distribution_cycle()?;
assert_eq!(report.total_distributed, 1_000);
assert_eq!(store.score_of(&player), Some(0));
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod allocation;
pub mod config;
pub mod cycle;
pub mod disburse;
pub mod journal;
pub mod ledger;
pub mod player;
pub mod prelude;
pub mod store;
pub mod units;
