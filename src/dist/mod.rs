//! Process-group membership and the reduction primitive shared by every worker.

mod context;
mod local;
mod tcp;

use std::{collections::BTreeMap, error::Error, fmt, io, time::Duration};

pub use context::{COORDINATOR_RANK, CoordContext, master_addr_from_env};
pub use local::{LocalCollective, LocalGroup};
pub use tcp::TcpCollective;

/// An ordered, keys-unique mapping from name to scalar.
pub type ScalarMap = BTreeMap<String, f64>;

/// Failures of the coordination layer. Every one of them is fatal for the run.
#[derive(Debug)]
pub enum CollectiveError {
    InvalidRank {
        rank: usize,
        world_size: usize,
    },
    Env {
        var: &'static str,
        detail: String,
    },
    /// Two workers entered the same reduction with different key sets.
    KeyMismatch {
        rank: usize,
        expected: Vec<String>,
        got: Vec<String>,
    },
    /// A peer aborted the group or left it while others still depended on it.
    Aborted(String),
    /// A peer spoke out of protocol.
    Protocol(String),
    Timeout(Duration),
    Io(io::Error),
}

impl fmt::Display for CollectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of {world_size}")
            }
            Self::Env { var, detail } => write!(f, "invalid {var}: {detail}"),
            Self::KeyMismatch {
                rank,
                expected,
                got,
            } => write!(
                f,
                "rank {rank} reduced keys {got:?} while the group reduced {expected:?}"
            ),
            Self::Aborted(reason) => write!(f, "worker group aborted: {reason}"),
            Self::Protocol(detail) => write!(f, "protocol violation: {detail}"),
            Self::Timeout(after) => write!(f, "reduction timed out after {after:?}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for CollectiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// A synchronous collective over every worker of the run.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait CollectiveTemplate {
    /// The role of this worker inside the group.
    fn context(&self) -> &CoordContext;

    /// Combines `values` across every worker of the group.
    ///
    /// Blocks until every worker contributed. With a single worker it returns
    /// `values` unchanged.
    ///
    /// # Arguments
    /// * `values` - This worker's contribution, every worker must present the same keys.
    /// * `average` - Whether to divide the sums by the world size.
    ///
    /// # Returns
    /// The sums (or means) with the same keys, in the same order.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if a peer is unreachable, crashed, aborted or
    /// disagrees on the key set. It is never retried.
    async fn all_reduce(
        &mut self,
        values: &ScalarMap,
        average: bool,
    ) -> Result<ScalarMap, CollectiveError>;

    /// Poisons the group so that peers blocked in a reduction, or entering one
    /// later, fail instead of waiting forever.
    ///
    /// # Arguments
    /// * `reason` - Human readable cause, surfaced on every peer.
    async fn abort(&mut self, reason: &str);
}

/// The collective of a run with a single worker.
#[derive(Debug, Clone)]
pub struct SingleProcess {
    ctx: CoordContext,
}

impl SingleProcess {
    pub fn new() -> Self {
        Self {
            ctx: CoordContext::single(),
        }
    }
}

impl Default for SingleProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl Collective for SingleProcess {
    fn context(&self) -> &CoordContext {
        &self.ctx
    }

    async fn all_reduce(
        &mut self,
        values: &ScalarMap,
        _average: bool,
    ) -> Result<ScalarMap, CollectiveError> {
        Ok(values.clone())
    }

    async fn abort(&mut self, reason: &str) {
        log::debug!("single process run aborted: {reason}");
    }
}

/// Builds the reduced mapping out of the summed values, laid out in key order.
fn reduced(keys: &[String], sums: &[f64], world_size: usize, average: bool) -> ScalarMap {
    let scale = if average { world_size as f64 } else { 1.0 };

    keys.iter()
        .zip(sums)
        .map(|(key, sum)| (key.clone(), sum / scale))
        .collect()
}

/// Splits a mapping into its keys and values, both in key order.
fn split(values: &ScalarMap) -> (Vec<String>, Vec<f64>) {
    values.iter().map(|(k, v)| (k.clone(), *v)).unzip()
}
