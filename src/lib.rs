/*!
# adaptive-mcmc

MCMC operator scheduling with self-tuning proposals and coupled-chain
convergence monitoring.

The building blocks, bottom up:

- [`proposal`]: moves ([`proposal::MoveKernel`]) with acceptance statistics
  and a persistable tunable parameter.
- [`schedule`]: weighted random selection over proposals, including nested
  percentage- and relative-weight groups, plus auto-optimization.
- [`chain`]: a single chain driving select → propose → accept/reject →
  optimize → log.
- [`multichain`]: N chains on parallel threads with live Gelman-Rubin
  reporting from their tailed log files.
- [`stats`]: the incremental Gelman-Rubin monitor and effective-sample-size
  estimators.

# Example

```rust
use adaptive_mcmc::chain::{Chain, ChainConfig};
use adaptive_mcmc::proposal::{Proposal, RandomWalkKernel, ScaleKernel};
use adaptive_mcmc::schedule::{OperatorSchedule, SubScheduleSpec};

// two top-level proposals plus a group holding 20% of the selection mass
let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(1_000);
schedule.add_proposal(Proposal::new("sigmaScaler", 1.0, ScaleKernel::new(0.5)).unwrap());
schedule.add_proposal(Proposal::new("meanWalker", 3.0, RandomWalkKernel::new(0.5)).unwrap());
schedule
    .add_subschedule(
        SubScheduleSpec::percentage(20.0)
            .with_proposal(Proposal::new("boldWalker", 1.0, RandomWalkKernel::new(2.0)).unwrap()),
    )
    .unwrap();

let posterior = |state: &[f64]| -0.5 * state.iter().map(|x| x * x).sum::<f64>();
let mut chain = Chain::new(posterior, schedule, &[0.0, 0.0], ChainConfig::new(5_000))
    .unwrap()
    .set_seed(42);
chain.run().unwrap();
```
*/

pub mod chain;
pub mod error;
pub mod io;
pub mod multichain;
pub mod proposal;
pub mod schedule;
pub mod stats;
