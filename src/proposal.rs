/*!
# Proposals

A [`Proposal`] is one MCMC move: a selection weight, accept/reject statistics,
and a [`MoveKernel`] that mutates the state vector and reports the log Hastings
ratio. Kernels are capabilities, not a class hierarchy: anything implementing
[`MoveKernel`] can be registered, and composite kernels own child `Proposal`s
instead of inheriting behavior.

Sentinel returns from [`MoveKernel::propose`]:

- `f64::NEG_INFINITY`: the move left the state invalid and must be rejected.
- `f64::INFINITY`: the move is a Gibbs move and must always be accepted.
- `Err(KernelFailure)`: the kernel failed internally; the chain recovers by
  rejecting and restoring the previous state.

Tuning state (the single tunable parameter plus all counters) round-trips
through [`TuningRecord`] so a resumed run continues optimizing where the
previous run stopped.

# Examples

```rust
use adaptive_mcmc::proposal::{Proposal, RandomWalkKernel};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut proposal = Proposal::new("walker", 1.0, RandomWalkKernel::new(0.5)).unwrap();
let mut state = vec![0.0, 0.0];
let mut rng = SmallRng::seed_from_u64(42);
let log_hastings = proposal.propose(&mut state, &mut rng).unwrap();
assert_eq!(log_hastings, 0.0); // symmetric move
```
*/

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::error::Error;

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Rejected by the Metropolis-Hastings coin flip.
    Chance,
    /// Rejected because the posterior of the proposed state is not finite.
    InvalidState,
    /// Rejected because the kernel itself failed (counted as a subset of
    /// the invalid rejections).
    OperatorFailure,
}

/// Recoverable failure raised by a kernel while proposing.
#[derive(Debug, Clone, Error)]
#[error("proposal kernel failed: {0}")]
pub struct KernelFailure(pub String);

/// The capability every MCMC move implements.
///
/// `propose` mutates `state` in place and returns the log Hastings ratio.
/// Kernels with a tunable parameter expose it through `tuning`/`set_tuning`
/// and adjust it in `optimize` when the schedule supplies a tuning step.
pub trait MoveKernel: Send {
    fn propose(&mut self, state: &mut [f64], rng: &mut SmallRng) -> Result<f64, KernelFailure>;

    /// The current tunable parameter, or NaN if the kernel is not tunable.
    fn tuning(&self) -> f64 {
        f64::NAN
    }

    fn set_tuning(&mut self, _value: f64) {}

    /// Apply a schedule-supplied tuning step. No-op for untunable kernels.
    fn optimize(&mut self, _delta: f64) {}

    /// Target acceptance probability used by the schedule when computing
    /// tuning steps. 0.234 is the standard optimal-scaling value.
    fn target_acceptance(&self) -> f64 {
        0.234
    }

    /// Child proposals of a composite kernel. Empty for simple kernels.
    fn children(&self) -> &[Proposal] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Proposal] {
        &mut []
    }

    /// Composite kernels forward acceptance bookkeeping to the child that
    /// produced the last move.
    fn on_accept(&mut self, _tuning_active: bool) {}

    fn on_reject(&mut self, _reason: RejectReason, _tuning_active: bool) {}
}

/// Accept/reject counters for one proposal.
///
/// The `_tuning` counters only move once the schedule's optimization delay
/// has passed; they feed the tuning step size. `rejected_operator` is a
/// subset of `rejected_invalid`, which is a subset of `rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceStats {
    pub accepted: u64,
    pub rejected: u64,
    pub accepted_tuning: u64,
    pub rejected_tuning: u64,
    pub rejected_invalid: u64,
    pub rejected_operator: u64,
}

impl AcceptanceStats {
    /// Total number of decided proposals.
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    /// Fraction of proposals accepted, NaN before the first decision.
    pub fn acceptance_rate(&self) -> f64 {
        self.accepted as f64 / self.total() as f64
    }
}

/// One registered MCMC move: identifier, selection weight, statistics and
/// the kernel doing the actual work.
pub struct Proposal {
    id: String,
    weight: f64,
    kernel: Box<dyn MoveKernel>,
    pub stats: AcceptanceStats,
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proposal")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("tuning", &self.kernel.tuning())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Proposal {
    /// Create a proposal. Fails if `weight` is not strictly positive.
    pub fn new(
        id: impl Into<String>,
        weight: f64,
        kernel: impl MoveKernel + 'static,
    ) -> Result<Self, Error> {
        let id = id.into();
        if !(weight > 0.0) {
            return Err(Error::InvalidWeight { id, weight });
        }
        Ok(Self {
            id,
            weight,
            kernel: Box::new(kernel),
            stats: AcceptanceStats::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Propose a new state in place, returning the log Hastings ratio.
    pub fn propose(
        &mut self,
        state: &mut [f64],
        rng: &mut SmallRng,
    ) -> Result<f64, KernelFailure> {
        self.kernel.propose(state, rng)
    }

    /// Record an accepted move. `tuning_active` is true once the schedule's
    /// optimization delay has passed.
    pub fn accept(&mut self, tuning_active: bool) {
        self.stats.accepted += 1;
        if tuning_active {
            self.stats.accepted_tuning += 1;
        }
        self.kernel.on_accept(tuning_active);
    }

    /// Record a rejected move with its reason.
    pub fn reject(&mut self, reason: RejectReason, tuning_active: bool) {
        self.stats.rejected += 1;
        match reason {
            RejectReason::Chance => {}
            RejectReason::InvalidState => {
                self.stats.rejected_invalid += 1;
            }
            RejectReason::OperatorFailure => {
                self.stats.rejected_invalid += 1;
                self.stats.rejected_operator += 1;
            }
        }
        if tuning_active {
            self.stats.rejected_tuning += 1;
        }
        self.kernel.on_reject(reason, tuning_active);
    }

    pub fn tuning(&self) -> f64 {
        self.kernel.tuning()
    }

    pub fn target_acceptance(&self) -> f64 {
        self.kernel.target_acceptance()
    }

    /// Apply a tuning step computed by the schedule.
    pub fn optimize(&mut self, delta: f64) {
        self.kernel.optimize(delta);
    }

    /// Serialize the tuning state, recursing into composite children.
    pub fn tuning_record(&self) -> TuningRecord {
        TuningRecord {
            id: self.id.clone(),
            p: TuningValue(self.kernel.tuning()),
            accept: self.stats.accepted,
            reject: self.stats.rejected,
            accept_fc: self.stats.accepted_tuning,
            reject_fc: self.stats.rejected_tuning,
            reject_iv: self.stats.rejected_invalid,
            reject_op: self.stats.rejected_operator,
            operators: self
                .kernel
                .children()
                .iter()
                .map(|c| c.tuning_record())
                .collect(),
        }
    }

    /// Restore counters and the tunable parameter from a saved record.
    ///
    /// A NaN tuning value leaves the kernel's parameter untouched; children
    /// of composite kernels are matched by id, and records for unknown
    /// children are reported and skipped.
    pub fn restore_tuning(&mut self, record: &TuningRecord) {
        if !record.p.0.is_nan() {
            self.kernel.set_tuning(record.p.0);
        }
        self.stats.accepted = record.accept;
        self.stats.rejected = record.reject;
        self.stats.accepted_tuning = record.accept_fc;
        self.stats.rejected_tuning = record.reject_fc;
        self.stats.rejected_invalid = record.reject_iv;
        self.stats.rejected_operator = record.reject_op;
        for child_record in &record.operators {
            match self
                .kernel
                .children_mut()
                .iter_mut()
                .find(|c| c.id == child_record.id)
            {
                Some(child) => child.restore_tuning(child_record),
                None => eprintln!(
                    "WARNING: state file contains operator ({}) that is no longer a child of {}",
                    child_record.id, self.id
                ),
            }
        }
    }
}

/// Tunable parameter value with NaN/Infinity string sentinels in JSON.
///
/// Serializes as a plain number when finite and as `"NaN"`, `"Infinity"` or
/// `"-Infinity"` otherwise, so state files stay valid JSON.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningValue(pub f64);

impl Serialize for TuningValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_str("NaN")
        } else if self.0 == f64::INFINITY {
            serializer.serialize_str("Infinity")
        } else if self.0 == f64::NEG_INFINITY {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

struct TuningValueVisitor;

impl Visitor<'_> for TuningValueVisitor {
    type Value = TuningValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number or one of \"NaN\", \"Infinity\", \"-Infinity\"")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(TuningValue(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(TuningValue(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(TuningValue(v as f64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        match v {
            "NaN" => Ok(TuningValue(f64::NAN)),
            "Infinity" => Ok(TuningValue(f64::INFINITY)),
            "-Infinity" => Ok(TuningValue(f64::NEG_INFINITY)),
            other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for TuningValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TuningValueVisitor)
    }
}

/// Persisted tuning state of one proposal.
///
/// `rejectIv` and `rejectOp` default to 0 so state files written before
/// detailed rejection counting restore cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningRecord {
    pub id: String,
    pub p: TuningValue,
    pub accept: u64,
    pub reject: u64,
    #[serde(rename = "acceptFC")]
    pub accept_fc: u64,
    #[serde(rename = "rejectFC")]
    pub reject_fc: u64,
    #[serde(rename = "rejectIv", default)]
    pub reject_iv: u64,
    #[serde(rename = "rejectOp", default)]
    pub reject_op: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<TuningRecord>,
}

/**
Multiplies one randomly chosen coordinate by a factor drawn uniformly from
`[λ, 1/λ]`, where `λ ∈ (0, 1)` is the tunable scale factor. The log Hastings
ratio is `-ln s` for the drawn factor `s`.

Smaller `λ` means a wider factor range and bolder moves; optimization walks
`λ` through logit space so it stays inside `(0, 1)`.
*/
#[derive(Debug, Clone)]
pub struct ScaleKernel {
    scale_factor: f64,
    lower: f64,
    upper: f64,
}

impl ScaleKernel {
    pub fn new(scale_factor: f64) -> Self {
        Self {
            scale_factor: scale_factor.clamp(1e-8, 1.0 - 1e-8),
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// Restrict scaled coordinates to `(lower, upper)`; moves leaving the
    /// interval are invalid and return `NEG_INFINITY`.
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }
}

impl MoveKernel for ScaleKernel {
    fn propose(&mut self, state: &mut [f64], rng: &mut SmallRng) -> Result<f64, KernelFailure> {
        if state.is_empty() {
            return Err(KernelFailure("cannot scale an empty state".into()));
        }
        let i = rng.gen_range(0..state.len());
        let lambda = self.scale_factor;
        let s = lambda + rng.gen::<f64>() * (1.0 / lambda - lambda);
        state[i] *= s;
        if state[i] <= self.lower || state[i] >= self.upper {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(-s.ln())
    }

    fn tuning(&self) -> f64 {
        self.scale_factor
    }

    fn set_tuning(&mut self, value: f64) {
        if value.is_finite() {
            self.scale_factor = value.clamp(1e-8, 1.0 - 1e-8);
        }
    }

    fn optimize(&mut self, delta: f64) {
        // positive delta = acceptance above target = widen the factor range
        let logit = (self.scale_factor / (1.0 - self.scale_factor)).ln() - delta;
        self.set_tuning(1.0 / (1.0 + (-logit).exp()));
    }
}

/**
Adds Gaussian noise with tunable standard deviation to one randomly chosen
coordinate. Symmetric, so the log Hastings ratio is always 0.
*/
#[derive(Debug, Clone)]
pub struct RandomWalkKernel {
    sigma: f64,
}

impl RandomWalkKernel {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl MoveKernel for RandomWalkKernel {
    fn propose(&mut self, state: &mut [f64], rng: &mut SmallRng) -> Result<f64, KernelFailure> {
        if state.is_empty() {
            return Err(KernelFailure("cannot walk an empty state".into()));
        }
        let normal = Normal::new(0.0, self.sigma)
            .map_err(|e| KernelFailure(format!("invalid step distribution: {e}")))?;
        let i = rng.gen_range(0..state.len());
        state[i] += normal.sample(rng);
        Ok(0.0)
    }

    fn tuning(&self) -> f64 {
        self.sigma
    }

    fn set_tuning(&mut self, value: f64) {
        if value.is_finite() && value > 0.0 {
            self.sigma = value;
        }
    }

    fn optimize(&mut self, delta: f64) {
        self.set_tuning((self.sigma.ln() + delta).exp());
    }
}

/// Redraws one randomly chosen coordinate uniformly in `[lower, upper)`.
/// Independent symmetric draw, log Hastings ratio 0; not tunable.
#[derive(Debug, Clone)]
pub struct UniformDrawKernel {
    lower: f64,
    upper: f64,
}

impl UniformDrawKernel {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

impl MoveKernel for UniformDrawKernel {
    fn propose(&mut self, state: &mut [f64], rng: &mut SmallRng) -> Result<f64, KernelFailure> {
        if state.is_empty() {
            return Err(KernelFailure("cannot draw into an empty state".into()));
        }
        let i = rng.gen_range(0..state.len());
        state[i] = rng.gen_range(self.lower..self.upper);
        Ok(0.0)
    }
}

/**
Composite kernel: selects one child [`Proposal`] per call with probability
proportional to the child weights, delegates the move, and forwards the
accept/reject outcome to that child so its statistics and tuning state stay
meaningful. Tuning records nest the children recursively.
*/
pub struct MixtureKernel {
    children: Vec<Proposal>,
    last: Option<usize>,
}

impl MixtureKernel {
    pub fn new(children: Vec<Proposal>) -> Self {
        Self {
            children,
            last: None,
        }
    }
}

impl MoveKernel for MixtureKernel {
    fn propose(&mut self, state: &mut [f64], rng: &mut SmallRng) -> Result<f64, KernelFailure> {
        if self.children.is_empty() {
            return Err(KernelFailure("mixture kernel has no children".into()));
        }
        let total: f64 = self.children.iter().map(|c| c.weight()).sum();
        let mut u = rng.gen::<f64>() * total;
        let mut chosen = self.children.len() - 1;
        for (i, child) in self.children.iter().enumerate() {
            u -= child.weight();
            if u < 0.0 {
                chosen = i;
                break;
            }
        }
        self.last = Some(chosen);
        self.children[chosen].propose(state, rng)
    }

    fn children(&self) -> &[Proposal] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut [Proposal] {
        &mut self.children
    }

    fn on_accept(&mut self, tuning_active: bool) {
        if let Some(i) = self.last {
            self.children[i].accept(tuning_active);
        }
    }

    fn on_reject(&mut self, reason: RejectReason, tuning_active: bool) {
        if let Some(i) = self.last {
            self.children[i].reject(reason, tuning_active);
        }
    }

    fn optimize(&mut self, delta: f64) {
        if let Some(i) = self.last {
            self.children[i].optimize(delta);
        }
    }
}
