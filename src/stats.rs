//! Convergence statistics for single and coupled chains.
//!
//! [`GelmanRubinMonitor`] maintains, per logged column and per chain, running
//! sums and sums of squares over a trailing window whose burn-in boundary is
//! 10% of the samples seen so far. The boundary advances one sample per ten
//! processed, and exactly the newly excluded sample's contribution is
//! subtracted from the running sums, so each update is O(1) amortized in the
//! window length. A virtual extra chain tracks the per-sample cross-chain
//! mean and feeds the between-chain variance.
//!
//! [`ess`]/[`act`] estimate the effective sample size of a single trace from
//! its integrated autocorrelation time, and [`EssTracker`] does the same
//! incrementally while a chain is still logging.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::{Float, ToPrimitive};

/// Longest lag considered by the autocorrelation-time estimators.
pub const MAX_LAG: usize = 2000;

/// One gated convergence report: the first chain's log row annotated with
/// the potential scale reduction per column.
#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    /// Sample index from the log row.
    pub sample: u64,
    /// The first chain's full row, including the sample index column.
    pub row: Vec<f64>,
    /// Gelman-Rubin R per column; `None` for the sample-index column and
    /// whenever fewer than six post-burn-in samples are available.
    pub r: Vec<Option<f64>>,
}

/// Incremental Gelman-Rubin potential scale reduction over parallel chains.
pub struct GelmanRubinMonitor {
    n_chains: usize,
    n_items: usize,
    tables: Vec<Vec<Vec<f64>>>,
    sums: Array2<f64>,
    squared_sums: Array2<f64>,
    latest_r: Vec<Option<f64>>,
}

impl GelmanRubinMonitor {
    pub fn new(n_chains: usize) -> Self {
        Self {
            n_chains,
            n_items: 0,
            tables: vec![Vec::new(); n_chains],
            sums: Array2::zeros((0, 0)),
            squared_sums: Array2::zeros((0, 0)),
            latest_r: Vec::new(),
        }
    }

    /// Number of rows processed per chain so far.
    pub fn n_rows(&self) -> usize {
        self.tables.first().map_or(0, |t| t.len())
    }

    /// The buffered rows, `chain -> row -> column`.
    pub fn tables(&self) -> &[Vec<Vec<f64>>] {
        &self.tables
    }

    /// Latest R per column.
    pub fn latest_r(&self) -> &[Option<f64>] {
        &self.latest_r
    }

    /// Largest currently available R across columns.
    pub fn max_r(&self) -> Option<f64> {
        let values: Vec<f64> = self.latest_r.iter().filter_map(|r| *r).collect();
        if values.is_empty() {
            return None;
        }
        let values = Array1::from(values);
        values.max().ok().copied()
    }

    /// Copy the buffered rows into a `chain × sample × column` array.
    pub fn to_array(&self) -> Array3<f64> {
        let rows = self.n_rows();
        let mut out = Array3::zeros((self.n_chains, rows, self.n_items));
        for (c, table) in self.tables.iter().enumerate() {
            for (s, row) in table.iter().enumerate() {
                for (i, v) in row.iter().enumerate() {
                    out[[c, s, i]] = *v;
                }
            }
        }
        out
    }

    /// Ingest one row per chain, all at the same sample index, and return the
    /// resulting report. Rows must all have the length of the first row ever
    /// seen; the caller is responsible for dropping ragged input.
    pub fn add_rows(&mut self, rows: &[Vec<f64>]) -> ConvergenceReport {
        debug_assert_eq!(rows.len(), self.n_chains);
        if self.n_items == 0 {
            self.n_items = rows[0].len();
            self.sums = Array2::zeros((self.n_chains + 1, self.n_items));
            self.squared_sums = Array2::zeros((self.n_chains + 1, self.n_items));
            self.latest_r = vec![None; self.n_items];
        }
        for (c, row) in rows.iter().enumerate() {
            self.tables[c].push(row.clone());
        }
        let k = self.tables[0].len() - 1;
        let m = self.n_chains;

        // the burn-in boundary moved: drop exactly one row from the sums
        if k > 0 && k / 10 != (k - 1) / 10 {
            let drop = (k - 1) / 10;
            for c in 0..m {
                for item in 1..self.n_items {
                    let v = self.tables[c][drop][item];
                    self.sums[[c, item]] -= v;
                    self.squared_sums[[c, item]] -= v * v;
                }
            }
            for item in 1..self.n_items {
                let mean =
                    (0..m).map(|c| self.tables[c][drop][item]).sum::<f64>() / m as f64;
                self.sums[[m, item]] -= mean;
                self.squared_sums[[m, item]] -= mean * mean;
            }
        }

        for (c, row) in rows.iter().enumerate() {
            for item in 1..self.n_items {
                let v = row[item];
                self.sums[[c, item]] += v;
                self.squared_sums[[c, item]] += v * v;
            }
        }
        for item in 1..self.n_items {
            let mean = rows.iter().map(|r| r[item]).sum::<f64>() / m as f64;
            self.sums[[m, item]] += mean;
            self.squared_sums[[m, item]] += mean * mean;
        }

        let n = k - k / 10;
        let mut r = vec![None; self.n_items];
        if n > 5 {
            let count = (n + 1) as f64; // rows k/10 ..= k
            for item in 1..self.n_items {
                let mut within = 0.0;
                for c in 0..m {
                    let s = self.sums[[c, item]];
                    within += self.squared_sums[[c, item]] - s * s / count;
                }
                let sv = self.sums[[m, item]];
                let var_means = self.squared_sums[[m, item]] - sv * sv / count;
                r[item] = psr(within, var_means, m, n);
            }
        }
        self.latest_r.clone_from(&r);
        ConvergenceReport {
            sample: rows[0][0] as u64,
            row: rows[0].clone(),
            r,
        }
    }
}

/// The potential scale reduction from the raw within- and between-chain
/// variance accumulations. `None` when the result is not finite or not
/// positive.
fn psr(within_raw: f64, var_means_raw: f64, m: usize, n: usize) -> Option<f64> {
    let mf = m as f64;
    let nf = n as f64;
    let w = within_raw / (mf * (nf - 1.0));
    let b = var_means_raw / ((mf - 1.0) * nf);
    let r = ((mf + 1.0) / mf) * ((nf - 1.0) / nf + (b / w) * (mf + 1.0) / (nf * mf))
        - (nf - 1.0) / (nf * mf);
    (r.is_finite() && r > 0.0).then_some(r)
}

/// Gelman-Rubin R per column computed from scratch over the same trailing
/// window the incremental monitor uses at row index `k`. Used to cross-check
/// the incremental updates.
pub fn batch_r(tables: &[Vec<Vec<f64>>], k: usize) -> Vec<Option<f64>> {
    let m = tables.len();
    let n_items = tables[0][0].len();
    let n = k - k / 10;
    let mut r = vec![None; n_items];
    if n <= 5 {
        return r;
    }
    let start = k / 10;
    let count = (n + 1) as f64;
    for item in 1..n_items {
        let mut within = 0.0;
        for table in tables {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for row in &table[start..=k] {
                sum += row[item];
                sum_sq += row[item] * row[item];
            }
            within += sum_sq - sum * sum / count;
        }
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for row_idx in start..=k {
            let mean =
                tables.iter().map(|t| t[row_idx][item]).sum::<f64>() / m as f64;
            sum += mean;
            sum_sq += mean * mean;
        }
        r[item] = psr(within, sum_sq - sum * sum / count, m, n);
    }
    r
}

/// Integrated autocorrelation time of a trace, using a 10% burn-in and lags
/// capped at [`MAX_LAG`].
///
/// Lag autocovariances of the post-burn-in trace around its mean accumulate
/// into `γ(0) + 2 Σ (γ(2j−1) + γ(2j))`, stopping at the first even lag whose
/// pairwise sum is no longer positive; the ratio to `γ(0)` is the number of
/// samples per effectively independent draw.
pub fn act<T: Float + ToPrimitive>(trace: &[T]) -> f64 {
    let burn_in = trace.len() / 10;
    let post: Vec<f64> = trace[burn_in..]
        .iter()
        .map(|v| v.to_f64().unwrap_or(f64::NAN))
        .collect();
    let n = post.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = post.iter().sum::<f64>() / n as f64;
    let max_lag = n.min(MAX_LAG);
    let mut gamma = vec![0.0; max_lag];
    for (lag, g) in gamma.iter_mut().enumerate() {
        let mut sum = 0.0;
        for i in 0..n - lag {
            sum += (post[i] - mean) * (post[i + lag] - mean);
        }
        *g = sum / (n - lag) as f64;
    }
    let mut var_stat = gamma[0];
    let mut lag = 2;
    while lag < max_lag {
        let pair = gamma[lag - 1] + gamma[lag];
        if pair <= 0.0 {
            break;
        }
        var_stat += 2.0 * pair;
        lag += 2;
    }
    var_stat / gamma[0]
}

/// Effective sample size of a trace: post-burn-in samples divided by the
/// integrated autocorrelation time.
pub fn ess<T: Float + ToPrimitive>(trace: &[T]) -> f64 {
    let post = trace.len() - trace.len() / 10;
    post as f64 / act(trace)
}

/// Incremental effective-sample-size estimator.
///
/// Tracks the running post-burn-in sum and the lagged products
/// `Σ trace[i]·trace[i+lag]`, compensating both whenever the 10% burn-in
/// boundary slides forward, so each [`push`] costs O(max_lag) instead of a
/// full recomputation.
///
/// [`push`]: EssTracker::push
#[derive(Debug, Clone, Default)]
pub struct EssTracker {
    trace: Vec<f64>,
    sum: f64,
    square_lagged_sums: Vec<f64>,
}

impl EssTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    /// Append a value and return the current effective sample size. NaN until
    /// enough samples accumulate for the autocorrelation to be defined.
    pub fn push(&mut self, value: f64) -> f64 {
        self.trace.push(value);
        self.sum += value;

        let total = self.trace.len();
        let start = total / 10;
        let boundary_moved = start != (total - 1) / 10;
        if boundary_moved {
            // compensate the sums for the sample leaving the window
            let leaving = (total - 1) / 10;
            self.sum -= self.trace[leaving];
            for lag in 0..self.square_lagged_sums.len() {
                self.square_lagged_sums[lag] -=
                    self.trace[leaving] * self.trace[leaving + lag];
            }
        }
        let sample_count = total - start;
        let max_lag = sample_count.min(MAX_LAG);
        let mean = self.sum / sample_count as f64;

        while self.square_lagged_sums.len() < max_lag {
            self.square_lagged_sums.push(0.0);
        }

        let mut auto_correlation = vec![0.0; max_lag];
        let mut sum1 = self.sum;
        let mut sum2 = self.sum;
        for lag in 0..max_lag {
            self.square_lagged_sums[lag] +=
                self.trace[total - lag - 1] * self.trace[total - 1];
            // the same covariance approximation Tracer uses: sum1, sum2 and
            // mean * (sample_count - lag) are close enough to interchange
            auto_correlation[lag] = self.square_lagged_sums[lag] - (sum1 + sum2) * mean
                + mean * mean * (sample_count - lag) as f64;
            auto_correlation[lag] /= (sample_count - lag) as f64;
            sum1 -= self.trace[total - 1 - lag];
            sum2 -= self.trace[start + lag];
        }

        let mut var_stat = auto_correlation[0];
        let mut lag = 2;
        while lag < max_lag {
            let pair = auto_correlation[lag - 1] + auto_correlation[lag];
            if pair <= 0.0 {
                break;
            }
            var_stat += 2.0 * pair;
            lag += 2;
        }

        let act = var_stat / auto_correlation[0];
        sample_count as f64 / act
    }
}
