/*!
# Operator schedule

The [`OperatorSchedule`] owns every registered [`Proposal`] and selects one per
chain step with probability proportional to its effective weight. Proposals are
registered either at the top level or through [`SubScheduleSpec`] groups, which
carry one of two weighting disciplines:

- **percentage** (`weight_is_percentage = true`): the group receives exactly
  `weight` percent of the total selection mass, split over its members in
  proportion to their declared weights. This lets an analysis say "spend 20% of
  proposal effort on these moves" without renormalizing everything else.
- **relative**: the group competes with top-level proposals as if it were a
  single proposal of the given weight, then splits internally by member weight.

A proposal may be claimed by several groups (by shared reference or by an
id-matching pattern); it appears once in the selection table and accumulates
every contribution. The schedule also owns auto-optimization: [`calc_delta`]
turns the realized acceptance probability of a move into a tuning step for the
proposal's kernel, after a configurable delay.

[`calc_delta`]: OperatorSchedule::calc_delta

# Examples

```rust
use adaptive_mcmc::proposal::{Proposal, RandomWalkKernel, ScaleKernel};
use adaptive_mcmc::schedule::{OperatorSchedule, SubScheduleSpec};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut schedule = OperatorSchedule::new();
schedule.add_proposal(Proposal::new("kappaScaler", 1.0, ScaleKernel::new(0.5)).unwrap());
schedule.add_proposal(Proposal::new("walker", 3.0, RandomWalkKernel::new(0.5)).unwrap());
schedule
    .add_subschedule(
        SubScheduleSpec::percentage(20.0)
            .with_proposal(Proposal::new("treeScaler", 20.0, ScaleKernel::new(0.75)).unwrap()),
    )
    .unwrap();

let mut rng = SmallRng::seed_from_u64(42);
let chosen = schedule.select(&mut rng).unwrap();
println!("selected {}", schedule.proposal(chosen).id());
```
*/

use rand::rngs::SmallRng;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::proposal::{Proposal, TuningRecord};

/// Handle to a proposal registered in an [`OperatorSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalId(pub(crate) usize);

/// Transform applied to the proposal-count term of the tuning step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizeTransform {
    #[default]
    None,
    Log,
    Sqrt,
}

/// Declaration of a nested proposal group.
///
/// `proposals` are new proposals owned by this group alone; `members`
/// reference proposals that are already registered (top level or in another
/// group); `pattern` is a regular expression matched against all registered
/// proposal ids when the schedule is finalized, auto-including every match.
pub struct SubScheduleSpec {
    pub weight: f64,
    pub weight_is_percentage: bool,
    pub proposals: Vec<Proposal>,
    pub members: Vec<ProposalId>,
    pub pattern: Option<String>,
}

impl SubScheduleSpec {
    /// A group holding `weight` percent of the total selection mass.
    pub fn percentage(weight: f64) -> Self {
        Self {
            weight,
            weight_is_percentage: true,
            proposals: Vec::new(),
            members: Vec::new(),
            pattern: None,
        }
    }

    /// A group competing like a single top-level proposal of `weight`.
    pub fn relative(weight: f64) -> Self {
        Self {
            weight,
            weight_is_percentage: false,
            proposals: Vec::new(),
            members: Vec::new(),
            pattern: None,
        }
    }

    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    pub fn with_member(mut self, member: ProposalId) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

struct SubSchedule {
    weight: f64,
    percentage: bool,
    regex: Option<Regex>,
    members: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct ScheduleState {
    operators: Vec<TuningRecord>,
}

/// Weighted selection over all registered proposals plus auto-optimization
/// bookkeeping. The cumulative-probability table is rebuilt lazily after any
/// registration change.
pub struct OperatorSchedule {
    proposals: Vec<Proposal>,
    top_level: Vec<usize>,
    subschedules: Vec<SubSchedule>,
    /// selection order: proposal index per table slot
    flat: Vec<usize>,
    normalized_weights: Vec<f64>,
    cumulative_probs: Vec<f64>,
    reweighted: bool,
    auto_optimize: bool,
    auto_optimize_delay: u64,
    delay_count: u64,
    transform: OptimizeTransform,
}

impl Default for OperatorSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorSchedule {
    pub fn new() -> Self {
        Self {
            proposals: Vec::new(),
            top_level: Vec::new(),
            subschedules: Vec::new(),
            flat: Vec::new(),
            normalized_weights: Vec::new(),
            cumulative_probs: Vec::new(),
            reweighted: false,
            auto_optimize: true,
            auto_optimize_delay: 10_000,
            delay_count: 0,
            transform: OptimizeTransform::None,
        }
    }

    pub fn with_auto_optimize(mut self, on: bool) -> Self {
        self.auto_optimize = on;
        self
    }

    /// Number of steps to take before tuning kicks in (default 10 000).
    pub fn with_auto_optimize_delay(mut self, delay: u64) -> Self {
        self.auto_optimize_delay = delay;
        self
    }

    pub fn with_transform(mut self, transform: OptimizeTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Register a top-level proposal and return its handle.
    pub fn add_proposal(&mut self, proposal: Proposal) -> ProposalId {
        let id = self.register(proposal);
        self.top_level.push(id.0);
        id
    }

    /// Register a proposal group. Returns handles for the proposals the group
    /// brought along, in order.
    pub fn add_subschedule(&mut self, spec: SubScheduleSpec) -> Result<Vec<ProposalId>> {
        if !(spec.weight > 0.0) {
            return Err(Error::InvalidWeight {
                id: "<sub-schedule>".into(),
                weight: spec.weight,
            });
        }
        let regex = match &spec.pattern {
            // anchored so the pattern must match the whole id
            Some(pattern) => Some(Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                Error::BadPattern {
                    pattern: pattern.clone(),
                    source: e,
                }
            })?),
            None => None,
        };
        let mut members: Vec<usize> = Vec::new();
        for m in &spec.members {
            if !members.contains(&m.0) {
                members.push(m.0);
            }
        }
        let mut new_ids = Vec::new();
        for proposal in spec.proposals {
            let id = self.register(proposal);
            members.push(id.0);
            new_ids.push(id);
        }
        self.subschedules.push(SubSchedule {
            weight: spec.weight,
            percentage: spec.weight_is_percentage,
            regex,
            members,
        });
        self.reweighted = false;
        Ok(new_ids)
    }

    fn register(&mut self, proposal: Proposal) -> ProposalId {
        self.proposals.push(proposal);
        self.reweighted = false;
        ProposalId(self.proposals.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn proposal(&self, id: ProposalId) -> &Proposal {
        &self.proposals[id.0]
    }

    pub fn proposal_mut(&mut self, id: ProposalId) -> &mut Proposal {
        &mut self.proposals[id.0]
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    /// Look up a registered proposal by its string id.
    pub fn find_proposal(&self, id: &str) -> Option<ProposalId> {
        self.proposals
            .iter()
            .position(|p| p.id() == id)
            .map(ProposalId)
    }

    /// True once the optimization delay has passed; the per-proposal tuning
    /// counters only move while this holds.
    pub fn tuning_active(&self) -> bool {
        self.delay_count >= self.auto_optimize_delay
    }

    /// Randomly select a proposal with probability proportional to its
    /// effective weight, rebuilding the selection table if needed.
    pub fn select(&mut self, rng: &mut SmallRng) -> Result<ProposalId> {
        self.ensure_weighted()?;
        let u: f64 = rng.gen();
        let slot = self.cumulative_probs.partition_point(|&c| c <= u);
        let slot = slot.min(self.flat.len() - 1);
        Ok(ProposalId(self.flat[slot]))
    }

    /// The cumulative selection probabilities in selection order. The last
    /// entry is exactly 1.0.
    pub fn cumulative_probs(&mut self) -> Result<&[f64]> {
        self.ensure_weighted()?;
        Ok(&self.cumulative_probs)
    }

    /// Probability of selecting `id` in one step.
    pub fn selection_probability(&mut self, id: ProposalId) -> Result<f64> {
        self.ensure_weighted()?;
        let slot = self
            .flat
            .iter()
            .position(|&p| p == id.0)
            .unwrap_or(usize::MAX);
        Ok(self.normalized_weights.get(slot).copied().unwrap_or(0.0))
    }

    /// Tuning step for `id` given the realized log acceptance probability.
    ///
    /// Returns 0 while the optimization delay has not passed (counting the
    /// call towards the delay) or when auto-optimization is off. The step is
    /// `(1/count)(e^{min(log_alpha, 0)} - target)` with `count` the number of
    /// tuning-window decisions, optionally log- or sqrt-transformed.
    pub fn calc_delta(&mut self, id: ProposalId, log_alpha: f64) -> f64 {
        if self.delay_count < self.auto_optimize_delay || !self.auto_optimize {
            self.delay_count += 1;
            return 0.0;
        }
        let proposal = &self.proposals[id.0];
        let target = proposal.target_acceptance();
        let mut count =
            (proposal.stats.rejected_tuning + proposal.stats.accepted_tuning + 1) as f64;
        count = match self.transform {
            OptimizeTransform::Log => (count + 1.0).ln(),
            OptimizeTransform::Sqrt => count.sqrt(),
            OptimizeTransform::None => count,
        };
        let delta = (1.0 / count) * (log_alpha.min(0.0).exp() - target);
        if delta.is_finite() {
            delta
        } else {
            0.0
        }
    }

    /// Compute and apply the tuning step for `id`.
    pub fn optimize(&mut self, id: ProposalId, log_alpha: f64) {
        let delta = self.calc_delta(id, log_alpha);
        if delta != 0.0 {
            self.proposals[id.0].optimize(delta);
        }
    }

    /// Persist the tuning state of every proposal as JSON.
    pub fn store_to_path(&self, path: &Path) -> Result<()> {
        let state = ScheduleState {
            operators: self.proposals.iter().map(|p| p.tuning_record()).collect(),
        };
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, &state)?;
        out.flush()?;
        Ok(())
    }

    /// Restore tuning state written by [`store_to_path`]. Records are matched
    /// by proposal id; records for unknown proposals are reported and
    /// skipped. The optimization delay counter resumes at the total number of
    /// restored decisions.
    ///
    /// [`store_to_path`]: OperatorSchedule::store_to_path
    pub fn restore_from_path(&mut self, path: &Path) -> Result<()> {
        let state: ScheduleState = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        self.delay_count = 0;
        for record in &state.operators {
            match self.proposals.iter_mut().find(|p| p.id() == record.id) {
                Some(proposal) => {
                    proposal.restore_tuning(record);
                    self.delay_count += record.accept + record.reject;
                }
                None => eprintln!(
                    "WARNING: operator ({}) found in state file that is not in the schedule any more",
                    record.id
                ),
            }
        }
        self.reweighted = false;
        Ok(())
    }

    /// Print a table of per-proposal tuning values, acceptance counts,
    /// selection probabilities and acceptance rates.
    pub fn show_rates<W: io::Write>(&mut self, out: &mut W) -> Result<()> {
        self.ensure_weighted()?;
        let name_width = self
            .flat
            .iter()
            .map(|&i| self.proposals[i].id().len())
            .max()
            .unwrap_or(8)
            .max(8);
        writeln!(
            out,
            "{:<name_width$} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "Operator", "Tuning", "#accept", "#reject", "Pr(m)", "Pr(acc|m)"
        )?;
        for (slot, &i) in self.flat.iter().enumerate() {
            let p = &self.proposals[i];
            let tuning = if p.tuning().is_nan() {
                format!("{:>10}", "-")
            } else {
                format!("{:>10.5}", p.tuning())
            };
            writeln!(
                out,
                "{:<name_width$} {} {:>10} {:>10} {:>10.5} {:>10.5}",
                p.id(),
                tuning,
                p.stats.accepted,
                p.stats.rejected,
                self.normalized_weights[slot],
                p.stats.acceptance_rate(),
            )?;
        }
        Ok(())
    }

    fn ensure_weighted(&mut self) -> Result<()> {
        if !self.reweighted {
            self.reweight()?;
            self.reweighted = true;
        }
        Ok(())
    }

    /// Resolve patterns, compute effective weights and rebuild the cumulative
    /// selection table.
    fn reweight(&mut self) -> Result<()> {
        if self.proposals.is_empty() {
            return Err(Error::EmptySchedule);
        }

        // auto-include pattern matches; idempotent across rebuilds
        for si in 0..self.subschedules.len() {
            if let Some(regex) = self.subschedules[si].regex.clone() {
                for i in 0..self.proposals.len() {
                    if regex.is_match(self.proposals[i].id())
                        && !self.subschedules[si].members.contains(&i)
                    {
                        self.subschedules[si].members.push(i);
                    }
                }
            }
        }

        let mut claimed = vec![false; self.proposals.len()];
        for sub in &self.subschedules {
            for &m in &sub.members {
                claimed[m] = true;
            }
        }

        let percent_sum: f64 = self
            .subschedules
            .iter()
            .filter(|s| s.percentage)
            .map(|s| s.weight)
            .sum();
        let relative_sum: f64 = self
            .subschedules
            .iter()
            .filter(|s| !s.percentage)
            .map(|s| s.weight)
            .sum();
        if percent_sum > 100.0 {
            return Err(Error::PercentageOverflow(percent_sum));
        }

        let locals: Vec<usize> = self
            .top_level
            .iter()
            .copied()
            .filter(|&i| !claimed[i])
            .collect();
        if (percent_sum - 100.0).abs() < 1e-6 && !locals.is_empty() {
            return Err(Error::PercentageConsumesAll);
        }
        let local_weight: f64 = locals.iter().map(|&i| self.proposals[i].weight()).sum();

        let total = if percent_sum >= 100.0 {
            100.0
        } else {
            (local_weight + relative_sum) * 100.0 / (100.0 - percent_sum)
        };

        // effective weight per proposal, contributions accumulating across groups
        let mut weights = vec![0.0; self.proposals.len()];
        for &i in &locals {
            weights[i] = self.proposals[i].weight() / total;
        }
        for sub in &self.subschedules {
            let member_sum: f64 = sub.members.iter().map(|&m| self.proposals[m].weight()).sum();
            if member_sum <= 0.0 {
                // a group without members holds no mass
                continue;
            }
            let factor = if sub.percentage {
                (sub.weight / 100.0) / member_sum
            } else {
                (sub.weight / member_sum) / total
            };
            for &m in &sub.members {
                weights[m] += factor * self.proposals[m].weight();
            }
        }

        // selection order: top-level proposals first, then group-only members
        let mut in_flat = vec![false; self.proposals.len()];
        self.flat.clear();
        for &i in &self.top_level {
            self.flat.push(i);
            in_flat[i] = true;
        }
        for sub in &self.subschedules {
            for &m in &sub.members {
                if !in_flat[m] {
                    self.flat.push(m);
                    in_flat[m] = true;
                }
            }
        }

        // normalize away mass lost to empty groups, then clamp the last
        // cumulative entry so a draw of ~1.0 cannot fall off the table
        let sum: f64 = self.flat.iter().map(|&i| weights[i]).sum();
        self.normalized_weights = self.flat.iter().map(|&i| weights[i] / sum).collect();
        self.cumulative_probs = Vec::with_capacity(self.flat.len());
        let mut cum = 0.0;
        for &w in &self.normalized_weights {
            cum += w;
            self.cumulative_probs.push(cum);
        }
        if let Some(last) = self.cumulative_probs.last_mut() {
            *last = 1.0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{RandomWalkKernel, ScaleKernel, UniformDrawKernel};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn walker(id: &str, weight: f64) -> Proposal {
        Proposal::new(id, weight, RandomWalkKernel::new(1.0)).unwrap()
    }

    fn assert_cumulative(schedule: &mut OperatorSchedule, expected: &[f64]) {
        let probs = schedule.cumulative_probs().unwrap().to_vec();
        assert_eq!(probs.len(), expected.len(), "table size mismatch: {probs:?}");
        for (got, want) in probs.iter().zip(expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn cumulative_table_is_normalized_and_monotone() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("a", 0.7));
        schedule.add_proposal(walker("b", 2.3));
        schedule.add_proposal(walker("c", 11.0));
        schedule
            .add_subschedule(
                SubScheduleSpec::relative(5.0)
                    .with_proposal(walker("d", 1.0))
                    .with_proposal(walker("e", 3.0)),
            )
            .unwrap();
        schedule
            .add_subschedule(SubScheduleSpec::percentage(15.0).with_proposal(walker("f", 9.0)))
            .unwrap();

        let probs = schedule.cumulative_probs().unwrap();
        assert_eq!(probs.len(), 6);
        assert_abs_diff_eq!(*probs.last().unwrap(), 1.0, epsilon = 1e-12);
        for pair in probs.windows(2) {
            assert!(pair[0] <= pair[1], "not monotone: {probs:?}");
        }
    }

    #[test]
    fn percentage_group_takes_exact_share() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_proposal(walker("op3", 20.0)))
            .unwrap();
        assert_cumulative(&mut schedule, &[0.2, 0.8, 1.0]);
    }

    #[test]
    fn relative_group_competes_as_one_proposal() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::relative(4.0).with_proposal(walker("op3", 20.0)))
            .unwrap();
        assert_cumulative(&mut schedule, &[1.0 / 8.0, 4.0 / 8.0, 1.0]);
    }

    #[test]
    fn relative_group_splits_members_proportionally() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(
                SubScheduleSpec::relative(4.0)
                    .with_proposal(walker("op3", 10.0))
                    .with_proposal(walker("op4", 10.0)),
            )
            .unwrap();
        assert_cumulative(&mut schedule, &[1.0 / 8.0, 4.0 / 8.0, 6.0 / 8.0, 1.0]);
    }

    #[test]
    fn two_percentage_groups_split_the_mass() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_proposal(walker("op3", 5.0)))
            .unwrap();
        schedule
            .add_subschedule(SubScheduleSpec::percentage(30.0).with_proposal(walker("op4", 7.0)))
            .unwrap();
        assert_cumulative(&mut schedule, &[1.25 / 10.0, 5.0 / 10.0, 7.0 / 10.0, 1.0]);
    }

    #[test]
    fn shared_member_accumulates_contributions() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        let ids = schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_proposal(walker("op3", 5.0)))
            .unwrap();
        // a second group claiming the same proposal adds its share on top
        schedule
            .add_subschedule(SubScheduleSpec::percentage(30.0).with_member(ids[0]))
            .unwrap();
        assert_cumulative(&mut schedule, &[1.0 / 8.0, 4.0 / 8.0, 1.0]);
    }

    #[test]
    fn pattern_claims_matching_top_level_proposals() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("treeScaler", 1.0));
        schedule.add_proposal(walker("kappaScaler", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_pattern("tree.*"))
            .unwrap();
        // treeScaler keeps its top-level slot but now holds the group's 20%
        assert_cumulative(&mut schedule, &[0.2, 1.0]);
    }

    #[test]
    fn pattern_matching_nothing_contributes_no_weight() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_pattern("species.*"))
            .unwrap();
        // the unclaimed 20% is redistributed proportionally
        assert_cumulative(&mut schedule, &[0.25, 1.0]);
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        let err = schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_pattern("tree["))
            .unwrap_err();
        assert!(matches!(err, Error::BadPattern { .. }));
    }

    #[test]
    fn empty_schedule_fails_fast() {
        let mut schedule = OperatorSchedule::new();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(matches!(schedule.select(&mut rng), Err(Error::EmptySchedule)));
    }

    #[test]
    fn percentage_overflow_fails_fast() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(60.0).with_proposal(walker("op2", 1.0)))
            .unwrap();
        schedule
            .add_subschedule(SubScheduleSpec::percentage(50.0).with_proposal(walker("op3", 1.0)))
            .unwrap();
        assert!(matches!(
            schedule.cumulative_probs(),
            Err(Error::PercentageOverflow(s)) if s == 110.0
        ));
    }

    #[test]
    fn full_percentage_with_top_level_proposals_fails_fast() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(100.0).with_proposal(walker("op2", 1.0)))
            .unwrap();
        assert!(matches!(
            schedule.cumulative_probs(),
            Err(Error::PercentageConsumesAll)
        ));
    }

    #[test]
    fn selection_frequencies_match_the_table() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("op1", 1.0));
        schedule.add_proposal(walker("op2", 3.0));
        schedule
            .add_subschedule(SubScheduleSpec::percentage(20.0).with_proposal(walker("op3", 20.0)))
            .unwrap();

        let mut rng = SmallRng::seed_from_u64(42);
        let mut counts: HashMap<String, u64> = HashMap::new();
        const DRAWS: u64 = 100_000;
        for _ in 0..DRAWS {
            let id = schedule.select(&mut rng).unwrap();
            *counts.entry(schedule.proposal(id).id().to_string()).or_default() += 1;
        }
        let freq = |name: &str| *counts.get(name).unwrap_or(&0) as f64 / DRAWS as f64;
        assert_abs_diff_eq!(freq("op1"), 0.2, epsilon = 0.01);
        assert_abs_diff_eq!(freq("op2"), 0.6, epsilon = 0.01);
        assert_abs_diff_eq!(freq("op3"), 0.2, epsilon = 0.01);
    }

    #[test]
    fn calc_delta_waits_for_the_delay() {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(3);
        let id = schedule.add_proposal(walker("op1", 1.0));
        assert!(!schedule.tuning_active());
        for _ in 0..3 {
            assert_eq!(schedule.calc_delta(id, 0.0), 0.0);
        }
        assert!(schedule.tuning_active());
        // count = 1, exp(min(0, 0)) = 1
        let delta = schedule.calc_delta(id, 0.0);
        assert_abs_diff_eq!(delta, 1.0 - 0.234, epsilon = 1e-12);
        // a poor move pushes the tuning the other way
        assert!(schedule.calc_delta(id, -10.0) < 0.0);
    }

    #[test]
    fn calc_delta_shrinks_with_decisions() {
        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(0);
        let id = schedule.add_proposal(walker("op1", 1.0));
        let first = schedule.calc_delta(id, 0.0);
        for _ in 0..9 {
            schedule.proposal_mut(id).accept(true);
        }
        let later = schedule.calc_delta(id, 0.0);
        assert_abs_diff_eq!(later, first / 10.0, epsilon = 1e-12);
    }

    #[test]
    fn disabled_auto_optimize_never_steps() {
        let mut schedule = OperatorSchedule::new()
            .with_auto_optimize(false)
            .with_auto_optimize_delay(0);
        let id = schedule.add_proposal(walker("op1", 1.0));
        for _ in 0..5 {
            assert_eq!(schedule.calc_delta(id, 0.0), 0.0);
        }
    }

    #[test]
    fn transforms_stretch_the_count() {
        for (transform, expected_count) in [
            (OptimizeTransform::None, 1.0),
            (OptimizeTransform::Log, 2.0_f64.ln()),
            (OptimizeTransform::Sqrt, 1.0),
        ] {
            let mut schedule = OperatorSchedule::new()
                .with_auto_optimize_delay(0)
                .with_transform(transform);
            let id = schedule.add_proposal(walker("op1", 1.0));
            let delta = schedule.calc_delta(id, 0.0);
            assert_abs_diff_eq!(
                delta,
                (1.0 / expected_count) * (1.0 - 0.234),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn state_file_round_trips_counters_and_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ops.json");

        let mut schedule = OperatorSchedule::new().with_auto_optimize_delay(5);
        let a = schedule.add_proposal(Proposal::new("scaler", 1.0, ScaleKernel::new(0.6)).unwrap());
        let b = schedule.add_proposal(walker("walk", 2.0));
        for _ in 0..4 {
            schedule.proposal_mut(a).accept(false);
        }
        for _ in 0..3 {
            schedule
                .proposal_mut(b)
                .reject(crate::proposal::RejectReason::Chance, false);
        }
        schedule.store_to_path(&path).unwrap();

        let mut restored = OperatorSchedule::new().with_auto_optimize_delay(5);
        let a2 = restored.add_proposal(Proposal::new("scaler", 1.0, ScaleKernel::new(0.3)).unwrap());
        restored.add_proposal(walker("walk", 2.0));
        restored.restore_from_path(&path).unwrap();

        assert_eq!(restored.proposal(a2).stats.accepted, 4);
        assert_abs_diff_eq!(restored.proposal(a2).tuning(), 0.6, epsilon = 1e-12);
        // 7 restored decisions exceed the delay of 5
        assert!(restored.tuning_active());
    }

    #[test]
    fn restore_skips_unknown_operators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ops.json");

        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(walker("gone", 1.0));
        schedule.add_proposal(walker("kept", 1.0));
        schedule.proposal_mut(ProposalId(1)).accept(false);
        schedule.store_to_path(&path).unwrap();

        let mut restored = OperatorSchedule::new();
        let kept = restored.add_proposal(walker("kept", 1.0));
        restored.restore_from_path(&path).unwrap();
        assert_eq!(restored.proposal(kept).stats.accepted, 1);
    }

    #[test]
    fn show_rates_lists_every_proposal() {
        let mut schedule = OperatorSchedule::new();
        schedule.add_proposal(Proposal::new("scaler", 1.0, ScaleKernel::new(0.5)).unwrap());
        schedule.add_proposal(Proposal::new("draw", 1.0, UniformDrawKernel::new(0.0, 1.0)).unwrap());
        let mut out = Vec::new();
        schedule.show_rates(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("scaler"));
        assert!(text.contains("draw"));
        // untunable proposals print a dash
        assert!(text.contains('-'));
    }
}
