use std::{error::Error, fmt, io};

use crate::{
    checkpoint::CheckpointError, config::ConfigError, dist::CollectiveError, guard::Divergence,
    metrics::MetricsError, model::ModelError, optim::OptimError,
};

/// Every way a run can end early. All of them are fatal.
#[derive(Debug)]
pub enum RunError {
    Divergence(Divergence),
    Collective(CollectiveError),
    Checkpoint(CheckpointError),
    Model(ModelError),
    Optim(OptimError),
    Metrics(MetricsError),
    Config(ConfigError),
    Io(io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Divergence(e) => write!(f, "training diverged: {e}"),
            Self::Collective(e) => write!(f, "collective failed: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint failed: {e}"),
            Self::Model(e) => write!(f, "model failed: {e}"),
            Self::Optim(e) => write!(f, "optimizer failed: {e}"),
            Self::Metrics(e) => write!(f, "metrics failed: {e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Divergence(e) => Some(e),
            Self::Collective(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Optim(e) => Some(e),
            Self::Metrics(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

macro_rules! impl_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for RunError {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from!(
    Divergence(Divergence),
    Collective(CollectiveError),
    Checkpoint(CheckpointError),
    Model(ModelError),
    Optim(OptimError),
    Metrics(MetricsError),
    Config(ConfigError),
    Io(io::Error),
);
