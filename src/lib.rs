//! Orchestration core for distributed training and evaluation of a vision and
//! language grounding model: the epoch loop, cross-worker metric aggregation,
//! checkpoint and resume, and the loss divergence guard.

pub mod checkpoint;
pub mod config;
pub mod dist;
pub mod engine;
pub mod error;
pub mod guard;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod orchestrator;
pub mod params;
pub mod synthetic;

pub use config::RunConfig;
pub use error::RunError;
pub use orchestrator::{EpochRecord, Orchestrator, Phase, RunSummary};
