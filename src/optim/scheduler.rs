use serde::{Deserialize, Serialize};

use super::{LrScheduler, OptimError, Optimizer};

/// Decays every group's learning rate by `gamma` each `step_size` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
    last_epoch: usize,
    base_lrs: Vec<f64>,
}

impl StepLr {
    /// # Arguments
    /// * `optimizer` - Its current learning rates become the base rates.
    /// * `step_size` - Epochs between decays, at least 1.
    /// * `gamma` - Multiplicative decay factor.
    pub fn new(optimizer: &dyn Optimizer, step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
            base_lrs: optimizer.lrs(),
        }
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn lr(&self, base: f64) -> f64 {
        base * self.gamma.powi((self.last_epoch / self.step_size) as i32)
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;

        for (group, base) in self.base_lrs.iter().enumerate() {
            optimizer.set_lr(group, self.lr(*base));
        }
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({
            "step_size": self.step_size,
            "gamma": self.gamma,
            "last_epoch": self.last_epoch,
            "base_lrs": self.base_lrs,
        })
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), OptimError> {
        let loaded: Self = serde_json::from_value(state)?;
        if loaded.base_lrs.len() != self.base_lrs.len() {
            return Err(OptimError::State(format!(
                "scheduler has {} groups, state has {}",
                self.base_lrs.len(),
                loaded.base_lrs.len()
            )));
        }

        *self = loaded;
        Ok(())
    }
}
