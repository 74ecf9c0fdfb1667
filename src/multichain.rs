/*!
# Coupled chains

[`MultiChain`] runs several independent chains in parallel and reports the
Gelman-Rubin potential scale reduction for every logged column while the
chains are still running.

Each chain gets its own seed (`base_seed + i`) and its own log file, derived
from a template that must contain the `$(seed)` placeholder — a template
without it would make the chains overwrite each other's logs, so it is
rejected before any thread starts.

One tailer thread per chain polls its log file for newly appended complete
lines, parses them, and forwards rows over a channel to an aggregation thread
that owns the [`GelmanRubinMonitor`]. Reports are gated on the slowest chain:
the report for sample index `k` is only produced once every chain has logged
a row at that index, and rows are consumed strictly in order. A chain that
stalls forever therefore blocks all further convergence output; the run
fails slow rather than reporting statistics built from unequal sample counts.

Malformed log lines are skipped; a diagnostic is printed for the first
chain's stream only. Comment lines and the header are skipped silently.
*/

use rayon::prelude::*;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::chain::{Chain, Posterior};
use crate::error::{Error, Result};
use crate::io::{is_silent_skip, parse_log_line};
use crate::stats::{ConvergenceReport, GelmanRubinMonitor};

/// Token substituted with `base_seed + chain_index` in log file templates.
pub const SEED_PLACEHOLDER: &str = "$(seed)";

/// Configuration of a coupled run.
#[derive(Debug, Clone)]
pub struct MultiChainConfig {
    /// Number of parallel chains (default 2).
    pub n_chains: usize,
    /// Seed of the first chain; chain `i` uses `base_seed + i`.
    pub base_seed: u64,
    /// Log file template containing [`SEED_PLACEHOLDER`].
    pub log_template: String,
    /// Sleep between polls of each chain's log file (default 1 s).
    pub poll_interval: Duration,
}

impl MultiChainConfig {
    pub fn new(log_template: impl Into<String>) -> Self {
        Self {
            n_chains: 2,
            base_seed: rand::thread_rng().gen(),
            log_template: log_template.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_n_chains(mut self, n_chains: usize) -> Self {
        self.n_chains = n_chains;
        self
    }

    pub fn with_base_seed(mut self, base_seed: u64) -> Self {
        self.base_seed = base_seed;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// N parallel chains plus the log-tailing and convergence-reporting
/// machinery.
pub struct MultiChain<P: Posterior> {
    chains: Vec<Chain<P>>,
    log_paths: Vec<PathBuf>,
    poll_interval: Duration,
}

impl<P: Posterior> MultiChain<P> {
    /// Build the coupled run. `build(chain_index, seed)` constructs each
    /// chain with its own schedule and posterior; the coordinator reseeds it
    /// and attaches its log file.
    pub fn new<F>(config: MultiChainConfig, mut build: F) -> Result<Self>
    where
        F: FnMut(usize, u64) -> Result<Chain<P>>,
    {
        if !config.log_template.contains(SEED_PLACEHOLDER) {
            return Err(Error::MissingSeedPlaceholder(config.log_template));
        }
        let mut chains = Vec::with_capacity(config.n_chains);
        let mut log_paths = Vec::with_capacity(config.n_chains);
        for i in 0..config.n_chains {
            let seed = config.base_seed + i as u64;
            let path =
                PathBuf::from(config.log_template.replace(SEED_PLACEHOLDER, &seed.to_string()));
            let chain = build(i, seed)?.set_seed(seed).with_log_file(&path)?;
            chains.push(chain);
            log_paths.push(path);
        }
        Ok(Self {
            chains,
            log_paths,
            poll_interval: config.poll_interval,
        })
    }

    pub fn chains(&self) -> &[Chain<P>] {
        &self.chains
    }

    pub fn log_paths(&self) -> &[PathBuf] {
        &self.log_paths
    }

    /// Run every chain to completion, printing one convergence line per
    /// fully gated sample index, and return the collected reports.
    pub fn run(&mut self) -> Result<Vec<ConvergenceReport>> {
        let n_chains = self.chains.len();
        if n_chains == 0 {
            return Ok(Vec::new());
        }
        let (tx, rx) = channel::<(usize, Vec<f64>)>();
        let done = Arc::new(AtomicBool::new(false));

        let mut tailers = Vec::with_capacity(n_chains);
        for (i, path) in self.log_paths.iter().enumerate() {
            let tx = tx.clone();
            let done = Arc::clone(&done);
            let path = path.clone();
            let poll = self.poll_interval;
            tailers.push(thread::spawn(move || tail_log(i, &path, poll, &done, &tx)));
        }
        drop(tx);

        let start = Instant::now();
        let aggregator = thread::spawn(move || aggregate(rx, n_chains, start));

        let results: Vec<(usize, Result<()>)> = self
            .chains
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| (i, chain.run()))
            .collect();
        done.store(true, Ordering::SeqCst);

        for tailer in tailers {
            tailer.join().map_err(|_| Error::ThreadPanic)?;
        }
        let reports = aggregator.join().map_err(|_| Error::ThreadPanic)?;

        for (i, result) in results {
            result.map_err(|e| Error::ChainFailed {
                chain: i,
                source: Box::new(e),
            })?;
        }
        Ok(reports)
    }
}

/// Poll one chain's log file, forwarding every complete parsed row. Exits
/// after a final drain once `done` is set.
fn tail_log(
    chain: usize,
    path: &Path,
    poll: Duration,
    done: &AtomicBool,
    tx: &Sender<(usize, Vec<f64>)>,
) {
    let file = loop {
        match File::open(path) {
            Ok(file) => break file,
            Err(_) => {
                if done.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(poll);
            }
        }
    };
    let mut reader = BufReader::new(file);
    let mut buf = String::new();
    let mut partial = String::new();
    loop {
        let finishing = done.load(Ordering::SeqCst);
        loop {
            buf.clear();
            match reader.read_line(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if !buf.ends_with('\n') {
                        // incomplete trailing line, finish it next round
                        partial.push_str(&buf);
                        break;
                    }
                    let line = format!("{partial}{buf}");
                    partial.clear();
                    let line = line.trim_end();
                    match parse_log_line(line) {
                        Some(row) => {
                            if tx.send((chain, row)).is_err() {
                                return;
                            }
                        }
                        None => {
                            if chain == 0 && !is_silent_skip(line) {
                                eprintln!("{line}");
                            }
                        }
                    }
                }
            }
        }
        if finishing {
            return;
        }
        thread::sleep(poll);
    }
}

/// Buffer rows per chain and emit one report per sample index once every
/// chain has reached it. Single-threaded ownership of the monitor keeps the
/// running-sum updates serialized.
fn aggregate(
    rx: Receiver<(usize, Vec<f64>)>,
    n_chains: usize,
    start: Instant,
) -> Vec<ConvergenceReport> {
    let mut monitor = GelmanRubinMonitor::new(n_chains);
    let mut pending: Vec<VecDeque<Vec<f64>>> = vec![VecDeque::new(); n_chains];
    let mut reports = Vec::new();
    let mut n_items = None;
    for (chain, row) in rx.iter() {
        match n_items {
            None => n_items = Some(row.len()),
            Some(expected) => {
                if row.len() != expected {
                    if chain == 0 {
                        eprintln!(
                            "skipping row with {} columns, expected {expected}",
                            row.len()
                        );
                    }
                    continue;
                }
            }
        }
        pending[chain].push_back(row);
        while pending.iter().all(|queue| !queue.is_empty()) {
            let rows: Vec<Vec<f64>> = pending
                .iter_mut()
                .map(|queue| queue.pop_front().expect("gated on non-empty queues"))
                .collect();
            let report = monitor.add_rows(&rows);
            println!("{}", render_report(&report, start.elapsed()));
            reports.push(report);
        }
    }
    reports
}

/// One console line per report: the sample index, every column value with
/// its R in parentheses, and the running time per million samples.
fn render_report(report: &ConvergenceReport, elapsed: Duration) -> String {
    let mut parts = vec![report.sample.to_string()];
    for (value, r) in report.row.iter().zip(&report.r).skip(1) {
        let r_text = match r {
            Some(r) => {
                let mut s = r.to_string();
                s.truncate(5);
                s
            }
            None => "-----".to_string(),
        };
        parts.push(format!("{}({r_text})", fixed_width(*value, 10)));
    }
    parts.push(format!(
        "{}/Msamples",
        time_per_msamples(elapsed, report.sample)
    ));
    parts.join("\t")
}

/// Truncate or pad a value to a fixed display width.
fn fixed_width(value: f64, width: usize) -> String {
    let mut s = value.to_string();
    if s.len() > width {
        s.truncate(width);
    } else {
        while s.len() < width {
            s.push(' ');
        }
    }
    s
}

fn time_per_msamples(elapsed: Duration, sample: u64) -> String {
    let seconds = (elapsed.as_millis() as f64 * 1000.0 / (sample as f64 + 1.0)) as u64;
    let mut out = String::new();
    if seconds >= 3600 {
        out.push_str(&format!("{}h", seconds / 3600));
    }
    if seconds >= 60 {
        out.push_str(&format!("{}m", (seconds % 3600) / 60));
    }
    out.push_str(&format!("{}s", seconds % 60));
    out
}
