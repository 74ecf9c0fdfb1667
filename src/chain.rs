/*!
# Single-chain runner

[`Chain`] drives one MCMC chain: each step snapshots the state, asks the
[`OperatorSchedule`] for a proposal, applies it, runs the Metropolis-Hastings
acceptance test against the [`Posterior`], feeds the outcome back into the
proposal's statistics and tuning, and periodically writes a log row and a
tuning-state snapshot.

A failed proposal (kernel error or a `NEG_INFINITY` Hastings ratio) is not
fatal: the chain counts it as an operator-failure rejection, restores the
snapshot and keeps running. The one fatal mid-run condition is a posterior of
positive infinity, which means the model itself is numerically broken.

# Examples

```rust
use adaptive_mcmc::chain::{Chain, ChainConfig};
use adaptive_mcmc::proposal::{Proposal, RandomWalkKernel};
use adaptive_mcmc::schedule::OperatorSchedule;

let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(100);
schedule.add_proposal(Proposal::new("walker", 1.0, RandomWalkKernel::new(0.5)).unwrap());

// standard normal posterior
let posterior = |state: &[f64]| -0.5 * state.iter().map(|x| x * x).sum::<f64>();

let config = ChainConfig::new(1_000);
let mut chain = Chain::new(posterior, schedule, &[0.0], config)
    .unwrap()
    .set_seed(42);
chain.run().unwrap();
assert!(chain.schedule().proposals()[0].stats.total() > 0);
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::io::TraceWriter;
use crate::proposal::RejectReason;
use crate::schedule::OperatorSchedule;

/// The model seen by a chain: an opaque log-posterior over the state vector.
/// Already-validated model construction happens elsewhere; the chain only
/// evaluates.
pub trait Posterior: Send {
    fn log_posterior(&self, state: &[f64]) -> f64;
}

impl<F> Posterior for F
where
    F: Fn(&[f64]) -> f64 + Send,
{
    fn log_posterior(&self, state: &[f64]) -> f64 {
        self(state)
    }
}

/// Run-length and output cadence of a chain.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Number of samples in the main loop.
    pub chain_length: u64,
    /// Steps taken before sample 0; statistics are not updated during these.
    pub pre_burnin: u64,
    /// Write a log row every this many samples.
    pub log_every: u64,
    /// Persist the tuning state every this many samples; 0 disables
    /// intermediate snapshots (the final state is always written).
    pub store_every: u64,
}

impl ChainConfig {
    pub fn new(chain_length: u64) -> Self {
        Self {
            chain_length,
            pre_burnin: 0,
            log_every: 1_000,
            store_every: 0,
        }
    }

    pub fn with_pre_burnin(mut self, pre_burnin: u64) -> Self {
        self.pre_burnin = pre_burnin;
        self
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn with_store_every(mut self, store_every: u64) -> Self {
        self.store_every = store_every;
        self
    }
}

/// Lifecycle of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// One MCMC chain over an opaque posterior.
pub struct Chain<P: Posterior> {
    posterior: P,
    schedule: OperatorSchedule,
    state: Vec<f64>,
    stored_state: Vec<f64>,
    current_log_post: f64,
    sample_nr: i64,
    config: ChainConfig,
    seed: u64,
    rng: SmallRng,
    writer: Option<TraceWriter>,
    state_path: Option<PathBuf>,
    status: ChainStatus,
}

impl<P: Posterior> std::fmt::Debug for Chain<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("state", &self.state)
            .field("stored_state", &self.stored_state)
            .field("current_log_post", &self.current_log_post)
            .field("sample_nr", &self.sample_nr)
            .field("config", &self.config)
            .field("seed", &self.seed)
            .field("state_path", &self.state_path)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<P: Posterior> Chain<P> {
    /// Create a chain starting at `initial_state`. Fails if the initial
    /// posterior is not finite, since the chain would have nowhere valid to
    /// move from.
    pub fn new(
        posterior: P,
        schedule: OperatorSchedule,
        initial_state: &[f64],
        config: ChainConfig,
    ) -> Result<Self> {
        let current_log_post = posterior.log_posterior(initial_state);
        if !current_log_post.is_finite() {
            return Err(Error::InvalidStartState(current_log_post));
        }
        let seed = rand::thread_rng().gen::<u64>();
        Ok(Self {
            posterior,
            schedule,
            state: initial_state.to_vec(),
            stored_state: initial_state.to_vec(),
            current_log_post,
            sample_nr: 0,
            config,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            writer: None,
            state_path: None,
            status: ChainStatus::Idle,
        })
    }

    /// Reseed the chain's random source for reproducible runs.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Log samples to `path`, writing the seed comment and column header
    /// immediately.
    pub fn with_log_file(mut self, path: &Path) -> Result<Self> {
        let mut writer = TraceWriter::create(path)?;
        writer.write_comment(&format!("seed {}", self.seed))?;
        let mut columns = vec!["Sample".to_string(), "posterior".to_string()];
        columns.extend((0..self.state.len()).map(|i| format!("dim_{i}")));
        writer.write_header(&columns)?;
        self.writer = Some(writer);
        Ok(self)
    }

    /// Persist tuning state to `path` at the configured cadence and at the
    /// end of the run.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Resume tuning from a previously written state file.
    pub fn restore_tuning_state(&mut self) -> Result<()> {
        if let Some(path) = self.state_path.clone() {
            self.schedule.restore_from_path(&path)?;
        }
        Ok(())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn log_posterior(&self) -> f64 {
        self.current_log_post
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut OperatorSchedule {
        &mut self.schedule
    }

    /// Perform one propose/accept/reject/optimize step.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.stored_state.copy_from_slice(&self.state);
        let old_log_post = self.current_log_post;
        let id = self.schedule.select(&mut self.rng)?;
        let past_burnin = self.sample_nr >= 0;
        let tuning_active = self.schedule.tuning_active();

        let log_hastings = self
            .schedule
            .proposal_mut(id)
            .propose(&mut self.state, &mut self.rng);
        let log_hastings = match log_hastings {
            Ok(h) if h != f64::NEG_INFINITY => h,
            // kernel failure or an invalid move: reject outright and move on
            _ => {
                if past_burnin {
                    self.schedule
                        .proposal_mut(id)
                        .reject(RejectReason::OperatorFailure, tuning_active);
                }
                self.state.copy_from_slice(&self.stored_state);
                return Ok(StepOutcome::Rejected(RejectReason::OperatorFailure));
            }
        };

        let new_log_post = self.posterior.log_posterior(&self.state);
        if new_log_post == f64::INFINITY {
            self.status = ChainStatus::Failed;
            return Err(Error::InvalidModel);
        }
        let log_alpha = new_log_post - old_log_post + log_hastings;
        let accept = log_alpha >= 0.0
            || (log_alpha != f64::NEG_INFINITY && self.rng.gen::<f64>() < log_alpha.exp());
        let outcome = if accept {
            self.current_log_post = new_log_post;
            if past_burnin {
                self.schedule.proposal_mut(id).accept(tuning_active);
            }
            StepOutcome::Accepted
        } else {
            let reason = if !new_log_post.is_finite() {
                RejectReason::InvalidState
            } else {
                RejectReason::Chance
            };
            if past_burnin {
                self.schedule.proposal_mut(id).reject(reason, tuning_active);
            }
            self.state.copy_from_slice(&self.stored_state);
            StepOutcome::Rejected(reason)
        };
        if past_burnin {
            self.schedule.optimize(id, log_alpha);
        }
        Ok(outcome)
    }

    /// Run the chain to its configured length.
    pub fn run(&mut self) -> Result<()> {
        self.run_inner(None)
    }

    /// Run the chain with a progress bar showing the acceptance rate.
    pub fn run_with_progress(&mut self) -> Result<()> {
        let pb = ProgressBar::new(self.config.pre_burnin + self.config.chain_length + 1);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        let result = self.run_inner(Some(&pb));
        pb.finish_with_message("done");
        result
    }

    fn run_inner(&mut self, progress: Option<&ProgressBar>) -> Result<()> {
        self.status = ChainStatus::Running;
        let chain_length = self.config.chain_length as i64;
        let mut sample = -(self.config.pre_burnin as i64);
        while sample <= chain_length {
            self.sample_nr = sample;
            if let Err(e) = self.step() {
                self.status = ChainStatus::Failed;
                return Err(e);
            }
            if sample >= 0 {
                let sample_u = sample as u64;
                if self.config.log_every > 0 && sample_u % self.config.log_every == 0 {
                    self.write_log_row(sample_u)?;
                }
                let store_every = self.config.store_every;
                if (store_every > 0 && (sample_u + 1) % store_every == 0)
                    || sample == chain_length
                {
                    self.store_tuning_state()?;
                }
            }
            if let Some(pb) = progress {
                pb.inc(1);
                if sample >= 0 && sample % 1_000 == 0 {
                    let decided: u64 = self
                        .schedule
                        .proposals()
                        .iter()
                        .map(|p| p.stats.total())
                        .sum();
                    let accepted: u64 = self
                        .schedule
                        .proposals()
                        .iter()
                        .map(|p| p.stats.accepted)
                        .sum();
                    if decided > 0 {
                        pb.set_message(format!(
                            "acc = {:.3}",
                            accepted as f64 / decided as f64
                        ));
                    }
                }
            }
            sample += 1;
        }
        self.status = ChainStatus::Completed;
        Ok(())
    }

    fn write_log_row(&mut self, sample: u64) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            let mut values = Vec::with_capacity(self.state.len() + 1);
            values.push(self.current_log_post);
            values.extend_from_slice(&self.state);
            writer.write_row(sample, &values)?;
        }
        Ok(())
    }

    fn store_tuning_state(&self) -> Result<()> {
        if let Some(path) = &self.state_path {
            self.schedule.store_to_path(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{KernelFailure, MoveKernel, Proposal, RandomWalkKernel};
    use approx::assert_abs_diff_eq;

    fn gaussian(state: &[f64]) -> f64 {
        -0.5 * state.iter().map(|x| x * x).sum::<f64>()
    }

    fn single_walker_schedule(delay: u64) -> OperatorSchedule {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(delay);
        schedule.add_proposal(Proposal::new("walker", 1.0, RandomWalkKernel::new(0.8)).unwrap());
        schedule
    }

    struct FailingKernel;

    impl MoveKernel for FailingKernel {
        fn propose(&mut self, _: &mut [f64], _: &mut SmallRng) -> Result<f64, KernelFailure> {
            Err(KernelFailure("injected".into()))
        }
    }

    struct GibbsKernel;

    impl MoveKernel for GibbsKernel {
        fn propose(
            &mut self,
            state: &mut [f64],
            rng: &mut SmallRng,
        ) -> Result<f64, KernelFailure> {
            state[0] = rng.gen::<f64>() - 0.5;
            Ok(f64::INFINITY)
        }
    }

    struct InvalidatingKernel;

    impl MoveKernel for InvalidatingKernel {
        fn propose(&mut self, state: &mut [f64], _: &mut SmallRng) -> Result<f64, KernelFailure> {
            // wander somewhere the posterior rules out entirely
            state[0] = f64::MAX;
            Ok(0.0)
        }
    }

    #[test]
    fn rejects_non_finite_start_state() {
        let schedule = single_walker_schedule(0);
        let err = Chain::new(
            |_: &[f64]| f64::NEG_INFINITY,
            schedule,
            &[0.0],
            ChainConfig::new(10),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidStartState(_)));
    }

    #[test]
    fn runs_to_completion_and_counts_every_decision() {
        let mut chain = Chain::new(gaussian, single_walker_schedule(0), &[0.5], ChainConfig::new(500))
            .unwrap()
            .set_seed(42);
        assert_eq!(chain.status(), ChainStatus::Idle);
        chain.run().unwrap();
        assert_eq!(chain.status(), ChainStatus::Completed);
        let stats = chain.schedule().proposals()[0].stats;
        assert_eq!(stats.total(), 501);
        assert!(stats.accepted > 0);
        assert!(stats.rejected > 0);
    }

    #[test]
    fn pre_burnin_steps_leave_counters_untouched() {
        let mut chain = Chain::new(
            gaussian,
            single_walker_schedule(u64::MAX),
            &[0.5],
            ChainConfig::new(100).with_pre_burnin(50),
        )
        .unwrap()
        .set_seed(7);
        chain.run().unwrap();
        let stats = chain.schedule().proposals()[0].stats;
        assert_eq!(stats.total(), 101);
    }

    #[test]
    fn kernel_failure_is_isolated() {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(0);
        schedule.add_proposal(Proposal::new("broken", 1.0, FailingKernel).unwrap());
        let mut chain = Chain::new(gaussian, schedule, &[0.25], ChainConfig::new(10))
            .unwrap()
            .set_seed(1);
        let state_before = chain.state().to_vec();
        let posterior_before = chain.log_posterior();

        let outcome = chain.step().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Rejected(RejectReason::OperatorFailure)
        );
        assert_eq!(chain.state(), state_before.as_slice());
        assert_abs_diff_eq!(chain.log_posterior(), posterior_before, epsilon = 0.0);

        let stats = chain.schedule().proposals()[0].stats;
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejected_invalid, 1);
        assert_eq!(stats.rejected_operator, 1);
        assert_eq!(stats.accepted, 0);
    }

    #[test]
    fn invalid_posterior_counts_as_invalid_rejection() {
        let posterior = |state: &[f64]| {
            if state[0] > 1e100 {
                f64::NEG_INFINITY
            } else {
                0.0
            }
        };
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(0);
        schedule.add_proposal(Proposal::new("invalidator", 1.0, InvalidatingKernel).unwrap());
        let mut chain = Chain::new(posterior, schedule, &[0.0], ChainConfig::new(10))
            .unwrap()
            .set_seed(2);

        let outcome = chain.step().unwrap();
        assert_eq!(outcome, StepOutcome::Rejected(RejectReason::InvalidState));
        assert_eq!(chain.state(), &[0.0]);
        let stats = chain.schedule().proposals()[0].stats;
        assert_eq!(stats.rejected_invalid, 1);
        assert_eq!(stats.rejected_operator, 0);
    }

    #[test]
    fn gibbs_moves_always_accept() {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(0);
        schedule.add_proposal(Proposal::new("gibbs", 1.0, GibbsKernel).unwrap());
        let mut chain = Chain::new(gaussian, schedule, &[0.0], ChainConfig::new(50))
            .unwrap()
            .set_seed(3);
        for _ in 0..50 {
            assert_eq!(chain.step().unwrap(), StepOutcome::Accepted);
        }
        let stats = chain.schedule().proposals()[0].stats;
        assert_eq!(stats.accepted, 50);
        assert_eq!(stats.rejected, 0);
    }

    #[test]
    fn positive_infinite_posterior_is_fatal() {
        let posterior = |state: &[f64]| {
            if state[0] == 0.0 {
                0.0
            } else {
                f64::INFINITY
            }
        };
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(0);
        schedule.add_proposal(Proposal::new("walker", 1.0, RandomWalkKernel::new(1.0)).unwrap());
        let mut chain = Chain::new(posterior, schedule, &[0.0], ChainConfig::new(10))
            .unwrap()
            .set_seed(4);
        let err = chain.run().unwrap_err();
        assert!(matches!(err, Error::InvalidModel));
        assert_eq!(chain.status(), ChainStatus::Failed);
    }

    #[test]
    fn identical_seeds_reproduce_the_trajectory() {
        let run = |seed: u64| {
            let mut chain =
                Chain::new(gaussian, single_walker_schedule(0), &[1.0], ChainConfig::new(200))
                    .unwrap()
                    .set_seed(seed);
            chain.run().unwrap();
            (chain.state().to_vec(), chain.log_posterior())
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9).0, run(10).0);
    }

    #[test]
    fn tuning_adapts_toward_target_acceptance() {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(500);
        schedule.add_proposal(
            // far too timid to start with
            Proposal::new("scaler", 1.0, RandomWalkKernel::new(1e-3)).unwrap(),
        );
        let mut chain = Chain::new(gaussian, schedule, &[0.1], ChainConfig::new(20_000))
            .unwrap()
            .set_seed(5);
        chain.run().unwrap();
        let tuned = chain.schedule().proposals()[0].tuning();
        assert!(
            tuned > 0.05 && tuned < 50.0,
            "step size should have grown toward a useful scale, got {tuned}"
        );
        let stats = chain.schedule().proposals()[0].stats;
        let tuning_rate =
            stats.accepted_tuning as f64 / (stats.accepted_tuning + stats.rejected_tuning) as f64;
        assert!(
            tuning_rate > 0.05 && tuning_rate < 0.95,
            "acceptance rate {tuning_rate} did not move toward the target"
        );
    }

    #[test]
    fn writes_log_rows_and_state_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("trace.log");
        let state_path = dir.path().join("trace.ops.json");

        let mut chain = Chain::new(
            gaussian,
            single_walker_schedule(0),
            &[0.5, -0.5],
            ChainConfig::new(100).with_log_every(10).with_store_every(50),
        )
        .unwrap()
        .set_seed(6)
        .with_log_file(&log_path)
        .unwrap()
        .with_state_file(&state_path);
        chain.run().unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let rows: Vec<&str> = contents
            .lines()
            .filter(|l| crate::io::parse_log_line(l).is_some())
            .collect();
        assert_eq!(rows.len(), 11); // samples 0, 10, ..., 100
        assert!(contents.starts_with("# seed 6"));
        assert!(contents.contains("Sample\tposterior\tdim_0\tdim_1"));

        // the final snapshot restores into a fresh schedule
        let mut restored = single_walker_schedule(0);
        restored.restore_from_path(&state_path).unwrap();
        assert_eq!(
            restored.proposals()[0].stats.total(),
            chain.schedule().proposals()[0].stats.total()
        );
    }
}
