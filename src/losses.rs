use crate::{dist::ScalarMap, model::WeightDict};

/// The loss terms of one step and the views derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct LossReport {
    /// The weighted sum of the weighted terms, the value being optimized.
    pub total: f64,
    /// `name -> weight * value` for every weighted term.
    pub scaled: ScalarMap,
    /// `{name}_unscaled -> value` for every term.
    pub unscaled: ScalarMap,
}

impl LossReport {
    /// Derives the reporting views of `terms`.
    ///
    /// # Arguments
    /// * `terms` - Every loss term of the step.
    /// * `weights` - The criterion weights; terms without one are reported only.
    pub fn new(terms: &ScalarMap, weights: &WeightDict) -> Self {
        let scaled: ScalarMap = terms
            .iter()
            .filter_map(|(name, value)| weights.get(name).map(|w| (name.clone(), value * w)))
            .collect();

        let unscaled = terms
            .iter()
            .map(|(name, value)| (unscaled_name(name), *value))
            .collect();

        Self {
            total: scaled.values().sum(),
            scaled,
            unscaled,
        }
    }

    /// Every meter a step may update: `loss`, each weighted term and each
    /// unscaled term.
    pub fn meter_names(loss_names: &[String], weights: &WeightDict) -> Vec<String> {
        std::iter::once("loss".to_string())
            .chain(loss_names.iter().filter(|n| weights.contains_key(*n)).cloned())
            .chain(loss_names.iter().map(|n| unscaled_name(n)))
            .collect()
    }

    /// `loss` plus both views, as recorded by the metric logger.
    pub fn meters(&self) -> ScalarMap {
        let mut meters = self.scaled.clone();
        meters.extend(self.unscaled.iter().map(|(k, v)| (k.clone(), *v)));
        meters.insert("loss".to_string(), self.total);
        meters
    }
}

fn unscaled_name(name: &str) -> String {
    format!("{name}_unscaled")
}
