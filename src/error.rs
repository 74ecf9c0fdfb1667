//! Error taxonomy for schedule configuration, chain execution and state files.
//!
//! Configuration errors are fatal and reported before any chain starts.
//! Recoverable conditions (failed proposals, invalid posterior states,
//! malformed log rows) never surface here; they are absorbed into the
//! per-proposal counters and the coordinator's skip policy.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A schedule was asked to select from an empty proposal set.
    #[error("operator schedule contains no proposals")]
    EmptySchedule,

    /// Proposal weights must be strictly positive.
    #[error("proposal {id:?} has non-positive weight {weight}")]
    InvalidWeight { id: String, weight: f64 },

    /// Percentage sub-schedules may not claim more than the whole probability mass.
    #[error("sub-schedule percentages sum to {0}%, which exceeds 100%")]
    PercentageOverflow(f64),

    /// All mass is claimed by percentage sub-schedules while top-level
    /// proposals exist; those proposals would never be selected.
    #[error("sub-schedule percentages sum to 100%, leaving top-level proposals unreachable")]
    PercentageConsumesAll,

    /// The operator pattern is not a valid regular expression.
    #[error("invalid operator pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    /// Multi-chain log templates must contain the `$(seed)` placeholder so
    /// chains cannot silently overwrite each other's output.
    #[error("log file template {0:?} does not contain the $(seed) placeholder")]
    MissingSeedPlaceholder(String),

    /// The posterior of the initial state is not finite, so the chain has
    /// nowhere valid to start from.
    #[error("posterior of the initial state is {0}; the chain cannot start")]
    InvalidStartState(f64),

    /// A positive-infinite posterior mid-run signals numerical instability
    /// in the model and aborts the chain.
    #[error("posterior evaluated to positive infinity; the model is numerically unstable")]
    InvalidModel,

    /// A chain worker returned an error during a coupled run.
    #[error("chain {chain} failed: {source}")]
    ChainFailed {
        chain: usize,
        #[source]
        source: Box<Error>,
    },

    /// An internal coordinator thread panicked.
    #[error("internal worker thread panicked")]
    ThreadPanic,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operator state file could not be parsed.
    #[error("malformed operator state file: {0}")]
    State(#[from] serde_json::Error),
}
