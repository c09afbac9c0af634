use std::{error::Error, fmt};

use log::error;

use crate::dist::ScalarMap;

/// A training loss that is no longer a finite number.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub loss: f64,
    /// The unscaled loss terms of the offending step.
    pub terms: ScalarMap,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loss is {}, stopping training", self.loss)
    }
}

impl Error for Divergence {}

/// Rejects a non-finite training loss, before any update is applied.
///
/// # Arguments
/// * `loss` - The step's optimized scalar.
/// * `unscaled` - The step's unscaled terms, dumped alongside the failure.
///
/// # Errors
/// Returns `Divergence` if `loss` is NaN or infinite.
pub fn check(loss: f64, unscaled: &ScalarMap) -> Result<(), Divergence> {
    if loss.is_finite() {
        return Ok(());
    }

    let divergence = Divergence {
        loss,
        terms: unscaled.clone(),
    };
    error!("{divergence}");
    error!("{unscaled:?}");
    Err(divergence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_losses_pass() {
        assert!(check(0.0, &ScalarMap::new()).is_ok());
        assert!(check(-1e30, &ScalarMap::new()).is_ok());
    }

    #[test]
    fn non_finite_losses_carry_the_terms() {
        let terms = ScalarMap::from([("loss_bbox_unscaled".to_string(), f64::INFINITY)]);

        for loss in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = check(loss, &terms).unwrap_err();
            assert_eq!(err.terms, terms);
        }

        assert_eq!(
            check(f64::INFINITY, &terms).unwrap_err().to_string(),
            "Loss is inf, stopping training"
        );
    }
}
