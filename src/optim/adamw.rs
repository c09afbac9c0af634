use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{OptimError, Optimizer, OptimizerState};
use crate::{model::Tensor, params::ParamStore};

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

/// A set of parameters sharing a learning rate and weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<String>,
    pub lr: f64,
    pub initial_lr: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, params: Vec<String>, lr: f64, weight_decay: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr,
            initial_lr: lr,
            weight_decay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Scalars {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: u64,
    groups: Vec<ParamGroup>,
}

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    scalars: Scalars,
    exp_avg: BTreeMap<String, Tensor>,
    exp_avg_sq: BTreeMap<String, Tensor>,
}

impl AdamW {
    /// Creates a new `AdamW` optimizer.
    ///
    /// # Arguments
    /// * `params` - The store the groups refer to, used to size the moment buffers.
    /// * `groups` - The parameter groups.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Errors
    /// Returns `OptimError::UnknownParam` if a group names a parameter missing from `params`.
    pub fn new(
        params: &ParamStore,
        groups: Vec<ParamGroup>,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    ) -> Result<Self, OptimError> {
        let mut exp_avg = BTreeMap::new();

        for name in groups.iter().flat_map(|g| &g.params) {
            let param = params
                .get(name)
                .ok_or_else(|| OptimError::UnknownParam(name.clone()))?;
            exp_avg.insert(name.clone(), Tensor::zeros(param.value.shape()));
        }

        Ok(Self {
            scalars: Scalars {
                beta1,
                beta2,
                epsilon,
                step: 0,
                groups,
            },
            exp_avg_sq: exp_avg.clone(),
            exp_avg,
        })
    }

    /// `AdamW` with the usual `(0.9, 0.999)` betas and `1e-8` epsilon.
    pub fn with_defaults(params: &ParamStore, groups: Vec<ParamGroup>) -> Result<Self, OptimError> {
        Self::new(params, groups, 0.9, 0.999, 1e-8)
    }

    pub fn steps(&self) -> u64 {
        self.scalars.step
    }

    fn check_buffers(&self, kind: &str, buffers: &BTreeMap<String, Tensor>) -> Result<(), OptimError> {
        for (name, own) in &self.exp_avg {
            let theirs = buffers
                .get(name)
                .ok_or_else(|| OptimError::State(format!("{kind} has no entry for {name:?}")))?;

            if theirs.shape() != own.shape() {
                return Err(OptimError::State(format!(
                    "{kind}.{name}: expected shape {:?}, got {:?}",
                    own.shape(),
                    theirs.shape()
                )));
            }
        }

        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
        self.scalars.step += 1;

        let Scalars {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            step,
            ..
        } = self.scalars;

        let bc1 = 1. - b1.powi(step as i32);
        let bc2_sqrt = (1. - b2.powi(step as i32)).sqrt();

        for group in &self.scalars.groups {
            let step_size = group.lr / bc1;
            let decay = 1. - group.lr * group.weight_decay;

            for name in &group.params {
                let param = params
                    .get_mut(name)
                    .ok_or_else(|| OptimError::UnknownParam(name.clone()))?;
                let (Some(m), Some(v)) = (self.exp_avg.get_mut(name), self.exp_avg_sq.get_mut(name))
                else {
                    return Err(OptimError::UnknownParam(name.clone()));
                };

                param
                    .value
                    .data_mut()
                    .iter_mut()
                    .zip(param.grad.data())
                    .zip(m.data_mut())
                    .zip(v.data_mut())
                    .for_each(|(((p, g), m), v)| {
                        let g = *g as f64;
                        let m_next = b1 * *m as f64 + (1. - b1) * g;
                        let v_next = b2 * *v as f64 + (1. - b2) * g * g;
                        let denom = v_next.sqrt() / bc2_sqrt + eps;

                        *m = m_next as f32;
                        *v = v_next as f32;
                        *p = (*p as f64 * decay - step_size * m_next / denom) as f32;
                    });
            }
        }

        Ok(())
    }

    fn lrs(&self) -> Vec<f64> {
        self.scalars.groups.iter().map(|g| g.lr).collect()
    }

    fn set_lr(&mut self, group: usize, lr: f64) {
        if let Some(g) = self.scalars.groups.get_mut(group) {
            g.lr = lr;
        }
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            scalars: serde_json::to_value(&self.scalars).unwrap_or_default(),
            buffers: BTreeMap::from([
                (EXP_AVG.to_string(), self.exp_avg.clone()),
                (EXP_AVG_SQ.to_string(), self.exp_avg_sq.clone()),
            ]),
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<(), OptimError> {
        let scalars: Scalars = serde_json::from_value(state.scalars)?;

        let own: Vec<_> = self.scalars.groups.iter().map(|g| &g.params).collect();
        let theirs: Vec<_> = scalars.groups.iter().map(|g| &g.params).collect();
        if own != theirs {
            return Err(OptimError::State("parameter groups differ".into()));
        }

        let exp_avg = state
            .buffers
            .remove(EXP_AVG)
            .ok_or_else(|| OptimError::State(format!("missing {EXP_AVG}")))?;
        let exp_avg_sq = state
            .buffers
            .remove(EXP_AVG_SQ)
            .ok_or_else(|| OptimError::State(format!("missing {EXP_AVG_SQ}")))?;

        self.check_buffers(EXP_AVG, &exp_avg)?;
        self.check_buffers(EXP_AVG_SQ, &exp_avg_sq)?;

        self.scalars = scalars;
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ParamStore, AdamW) {
        let mut params = ParamStore::new();
        params.insert("w", Tensor::new(vec![2], vec![1., -1.]).unwrap(), true);
        let groups = vec![ParamGroup::new("head", vec!["w".into()], 0.1, 0.)];
        let optim = AdamW::with_defaults(&params, groups).unwrap();
        (params, optim)
    }

    #[test]
    fn first_step_moves_by_lr_against_the_gradient_sign() {
        let (mut params, mut optim) = setup();
        params.get_mut("w").unwrap().grad = Tensor::new(vec![2], vec![0.5, -2.]).unwrap();

        optim.step(&mut params).unwrap();

        let w = params.get("w").unwrap().value.data();
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 0.9).abs() < 1e-5);
        assert_eq!(optim.steps(), 1);
    }

    #[test]
    fn weight_decay_shrinks_without_gradient() {
        let mut params = ParamStore::new();
        params.insert("w", Tensor::new(vec![1], vec![2.]).unwrap(), true);
        let groups = vec![ParamGroup::new("head", vec!["w".into()], 0.1, 0.5)];
        let mut optim = AdamW::with_defaults(&params, groups).unwrap();

        optim.step(&mut params).unwrap();
        assert!((params.get("w").unwrap().value.data()[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn unknown_group_param_is_rejected() {
        let params = ParamStore::new();
        let groups = vec![ParamGroup::new("head", vec!["nope".into()], 0.1, 0.)];

        assert!(matches!(
            AdamW::with_defaults(&params, groups),
            Err(OptimError::UnknownParam(name)) if name == "nope"
        ));
    }

    #[test]
    fn state_round_trips_exactly() {
        let (mut params, mut optim) = setup();
        params.get_mut("w").unwrap().grad = Tensor::new(vec![2], vec![0.3, 0.7]).unwrap();
        optim.step(&mut params).unwrap();
        optim.set_lr(0, 0.01);

        let state = optim.state();
        let (_, mut fresh) = setup();
        fresh.load_state(state.clone()).unwrap();

        assert_eq!(fresh.state(), state);
        assert_eq!(fresh.lrs(), [0.01]);
        assert_eq!(fresh.steps(), 1);
    }

    #[test]
    fn foreign_state_is_rejected_and_ignored() {
        let (_, mut optim) = setup();
        let mut state = optim.state();
        state.buffers.remove(EXP_AVG_SQ);

        assert!(optim.load_state(state).is_err());
        assert_eq!(optim.steps(), 0);
    }
}
