//! Windowed and running statistics of named scalars, kept consistent across workers.

mod logger;
mod smoothed;

use std::{error::Error, fmt};

pub use logger::{MetricLogger, Progress, fmt_duration};
pub use smoothed::{DEFAULT_WINDOW, MeterFormat, SmoothedValue};

#[derive(Debug)]
pub enum MetricsError {
    /// The name isn't part of the declared meter set.
    UnknownMeter(String),
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMeter(name) => write!(f, "metric {name:?} was never declared"),
        }
    }
}

impl Error for MetricsError {}
