//! Parameter updates and learning rate schedules.

mod adamw;
mod scheduler;

use std::{collections::BTreeMap, error::Error, fmt};

pub use adamw::{AdamW, ParamGroup};
pub use scheduler::StepLr;

use crate::{
    model::Tensor,
    params::{ParamStore, Parameter},
};

#[derive(Debug)]
pub enum OptimError {
    /// A parameter referenced by a group doesn't exist in the store.
    UnknownParam(String),
    /// A state being loaded doesn't match this optimizer.
    State(String),
}

impl fmt::Display for OptimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownParam(name) => write!(f, "unknown parameter {name:?}"),
            Self::State(detail) => write!(f, "incompatible optimizer state: {detail}"),
        }
    }
}

impl Error for OptimError {}

impl From<serde_json::Error> for OptimError {
    fn from(value: serde_json::Error) -> Self {
        Self::State(value.to_string())
    }
}

/// The resumable state of an optimizer: scalar settings plus named per
/// parameter buffers, e.g. `exp_avg` -> parameter name -> tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub scalars: serde_json::Value,
    pub buffers: BTreeMap<String, BTreeMap<String, Tensor>>,
}

/// Updates model parameters out of their accumulated gradients.
pub trait Optimizer {
    fn zero_grad(&self, params: &mut ParamStore) {
        params.zero_grad();
    }

    /// # Errors
    /// Returns an `OptimError` if a grouped parameter is missing from `params`.
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError>;

    /// The current learning rate of every parameter group, in group order.
    fn lrs(&self) -> Vec<f64>;

    fn set_lr(&mut self, group: usize, lr: f64);

    fn state(&self) -> OptimizerState;

    /// # Errors
    /// Returns `OptimError::State` if `state` was produced by a different
    /// optimizer or parameter layout. `self` is left untouched in that case.
    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimError>;
}

/// Adjusts the optimizer learning rates once per epoch.
pub trait LrScheduler {
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn state(&self) -> serde_json::Value;

    /// # Errors
    /// Returns `OptimError::State` if `state` can't be read back.
    fn load_state(&mut self, state: serde_json::Value) -> Result<(), OptimError>;
}

/// Splits the trainable parameters into the head group (`lr`) and the
/// backbone group (`lr_backbone`), in that order.
pub fn param_groups(params: &ParamStore, lr: f64, lr_backbone: f64, weight_decay: f64) -> Vec<ParamGroup> {
    let (backbone, head): (Vec<_>, Vec<_>) = params
        .iter()
        .filter(|(_, p)| p.requires_grad)
        .map(|(name, _)| name.clone())
        .partition(|name| Parameter::is_backbone(name));

    vec![
        ParamGroup::new("head", head, lr, weight_decay),
        ParamGroup::new("backbone", backbone, lr_backbone, weight_decay),
    ]
}
