use std::collections::BTreeMap;

use crate::model::{ModelError, Tensor};

/// A named trainable tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Tensor,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(value: Tensor, requires_grad: bool) -> Self {
        let grad = Tensor::zeros(value.shape());

        Self {
            value,
            grad,
            requires_grad,
        }
    }

    pub fn is_backbone(name: &str) -> bool {
        name.contains("backbone")
    }
}

/// The parameters of a model, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    params: BTreeMap<String, Parameter>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor, requires_grad: bool) {
        self.params
            .insert(name.into(), Parameter::new(value, requires_grad));
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// The amount of scalars that receive gradients.
    pub fn n_trainable(&self) -> usize {
        self.params
            .values()
            .filter(|p| p.requires_grad)
            .map(|p| p.value.numel())
            .sum()
    }

    pub fn zero_grad(&mut self) {
        self.params.values_mut().for_each(|p| p.grad.fill(0.));
    }

    /// The L2 norm of every trainable gradient seen as one vector.
    pub fn grad_norm(&self) -> f64 {
        self.params
            .values()
            .filter(|p| p.requires_grad)
            .map(|p| p.grad.sq_norm())
            .sum::<f64>()
            .sqrt()
    }

    /// Rescales the trainable gradients so that their global norm is at most
    /// `max_norm`.
    ///
    /// # Returns
    /// The global norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let total = self.grad_norm();
        let coef = max_norm / (total + 1e-6);

        if coef < 1. {
            self.params
                .values_mut()
                .filter(|p| p.requires_grad)
                .for_each(|p| {
                    p.grad
                        .data_mut()
                        .iter_mut()
                        .for_each(|g| *g = (*g as f64 * coef) as f32)
                });
        }

        total
    }

    /// Overwrites the value of `name`.
    ///
    /// # Returns
    /// `false` if there's no parameter called `name`.
    ///
    /// # Errors
    /// Returns `ModelError::Shape` if `value` has a different shape.
    pub fn assign(&mut self, name: &str, value: Tensor) -> Result<bool, ModelError> {
        let Some(param) = self.params.get_mut(name) else {
            return Ok(false);
        };

        if param.value.shape() != value.shape() {
            return Err(ModelError::Shape {
                name: name.to_string(),
                expected: param.value.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }

        param.value = value;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParamStore {
        let mut store = ParamStore::new();
        store.insert("head.w", Tensor::new(vec![2], vec![0., 0.]).unwrap(), true);
        store.insert("backbone.w", Tensor::new(vec![3], vec![0.; 3]).unwrap(), true);
        store.insert("frozen", Tensor::new(vec![4], vec![0.; 4]).unwrap(), false);
        store
    }

    fn set_grads(store: &mut ParamStore) {
        store.get_mut("head.w").unwrap().grad = Tensor::new(vec![2], vec![3., 0.]).unwrap();
        store.get_mut("backbone.w").unwrap().grad = Tensor::new(vec![3], vec![0., 4., 0.]).unwrap();
        store.get_mut("frozen").unwrap().grad = Tensor::new(vec![4], vec![100.; 4]).unwrap();
    }

    #[test]
    fn counts_trainable_scalars_only() {
        assert_eq!(store().n_trainable(), 5);
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let mut store = store();
        set_grads(&mut store);

        let before = store.clip_grad_norm(1.0);
        assert!((before - 5.0).abs() < 1e-9);
        assert!((store.grad_norm() - 1.0).abs() < 1e-5);
        assert_eq!(store.get("frozen").unwrap().grad.data(), [100.; 4]);
    }

    #[test]
    fn clipping_leaves_small_gradients_alone() {
        let mut store = store();
        set_grads(&mut store);
        let grads = store.get("head.w").unwrap().grad.clone();

        store.clip_grad_norm(10.0);
        assert_eq!(store.get("head.w").unwrap().grad, grads);
    }

    #[test]
    fn assign_checks_shapes() {
        let mut store = store();

        assert!(store.assign("head.w", Tensor::new(vec![2], vec![1., 2.]).unwrap()).unwrap());
        assert!(!store.assign("missing", Tensor::zeros(&[2])).unwrap());
        assert!(matches!(
            store.assign("head.w", Tensor::zeros(&[3])),
            Err(ModelError::Shape { .. })
        ));
    }
}
