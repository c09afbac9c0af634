use std::{env, net::SocketAddr, num::NonZeroUsize};

use super::CollectiveError;

/// Rank zero owns every side effect of a run.
pub const COORDINATOR_RANK: usize = 0;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// Immutable description of this process's role inside the worker group.
///
/// Built once at startup and handed to every component that needs to know
/// who it is, instead of being queried from process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordContext {
    pub(super) rank: usize,
    pub(super) world_size: NonZeroUsize,
}

impl CoordContext {
    /// Creates a new coordination context.
    ///
    /// # Args
    /// * `rank` - The index of this worker, in `0..world_size`.
    /// * `world_size` - The amount of cooperating workers.
    ///
    /// # Returns
    /// A new `CoordContext` or an error if `rank` is out of range.
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Result<Self, CollectiveError> {
        if rank >= world_size.get() {
            return Err(CollectiveError::InvalidRank {
                rank,
                world_size: world_size.get(),
            });
        }

        Ok(Self { rank, world_size })
    }

    /// The context of a run that isn't distributed at all.
    pub fn single() -> Self {
        Self {
            rank: COORDINATOR_RANK,
            world_size: NonZeroUsize::MIN,
        }
    }

    /// Resolves the role of this process from the `RANK` and `WORLD_SIZE`
    /// environment variables, falling back to a single process run when they
    /// are not set.
    ///
    /// # Errors
    /// Returns `CollectiveError::Env` when the variables are present but malformed.
    pub fn from_env() -> Result<Self, CollectiveError> {
        let (Ok(rank), Ok(world_size)) = (env::var("RANK"), env::var("WORLD_SIZE")) else {
            return Ok(Self::single());
        };

        let rank = parse_env("RANK", &rank)?;
        let world_size = parse_env("WORLD_SIZE", &world_size)?;
        let world_size = NonZeroUsize::new(world_size).ok_or_else(|| CollectiveError::Env {
            var: "WORLD_SIZE",
            detail: "must be at least 1".into(),
        })?;

        Self::new(rank, world_size)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size.get()
    }

    /// Whether more than one worker takes part in the run.
    pub fn is_distributed(&self) -> bool {
        self.world_size.get() > 1
    }

    /// The single-writer predicate gating logging, checkpoints and visualization.
    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR_RANK
    }
}

/// Resolves the rendezvous address of the coordinator from `MASTER_ADDR` and
/// `MASTER_PORT`.
///
/// # Errors
/// Returns `CollectiveError::Env` if the resulting address can't be parsed.
pub fn master_addr_from_env() -> Result<SocketAddr, CollectiveError> {
    let host = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
    let port = match env::var("MASTER_PORT") {
        Ok(port) => parse_env("MASTER_PORT", &port)?,
        Err(_) => DEFAULT_MASTER_PORT,
    };

    format!("{host}:{port}")
        .parse()
        .map_err(|e| CollectiveError::Env {
            var: "MASTER_ADDR",
            detail: format!("{e}"),
        })
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, CollectiveError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| CollectiveError::Env {
        var,
        detail: format!("{value:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_is_the_coordinator() {
        let world = NonZeroUsize::new(3).unwrap();

        assert!(CoordContext::new(0, world).unwrap().is_coordinator());
        assert!(!CoordContext::new(2, world).unwrap().is_coordinator());
        assert!(CoordContext::new(0, world).unwrap().is_distributed());
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let world = NonZeroUsize::new(2).unwrap();
        assert!(matches!(
            CoordContext::new(2, world),
            Err(CollectiveError::InvalidRank { rank: 2, world_size: 2 })
        ));
    }

    #[test]
    fn single_process_context() {
        let ctx = CoordContext::single();
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        assert!(!ctx.is_distributed());
        assert!(ctx.is_coordinator());
    }
}
