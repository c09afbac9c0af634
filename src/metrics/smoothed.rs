use std::{collections::VecDeque, fmt};

use crate::dist::{Collective, CollectiveError, ScalarMap};

/// Default amount of observations kept in the display window.
pub const DEFAULT_WINDOW: usize = 20;

/// How a meter renders itself in progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeterFormat {
    /// `median (global average)` with 4 decimals.
    #[default]
    MedianGlobal,
    /// The last observed value with 6 decimals, used for learning rates.
    Latest,
}

/// Tracks a series of values, giving access to smoothed values over a window
/// and to the exact running average of the whole series.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
    format: MeterFormat,
}

impl SmoothedValue {
    /// Creates a new empty meter.
    ///
    /// # Arguments
    /// * `window_size` - Amount of most recent observations used for smoothing, at least 1.
    /// * `format` - How the meter is displayed.
    pub fn new(window_size: usize, format: MeterFormat) -> Self {
        let window_size = window_size.max(1);

        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0.0,
            count: 0,
            format,
        }
    }

    /// Records `value`, counted `weight` times in the running average.
    pub fn update(&mut self, value: f64, weight: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }

        self.window.push_back(value);
        self.count += weight;
        self.total += value * weight as f64;
    }

    /// The lower median of the window, NaN when empty.
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        if sorted.is_empty() {
            return f64::NAN;
        }

        sorted.sort_by(f64::total_cmp);
        sorted[(sorted.len() - 1) / 2]
    }

    /// The mean of the window, NaN when empty.
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }

        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// The running average since the last reset, NaN when nothing was recorded.
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }

        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NAN, f64::max)
    }

    /// The last recorded value.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(f64::NAN)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Replaces this worker's running count and total with the sums over every
    /// worker of the group. The window stays local.
    ///
    /// # Arguments
    /// * `name` - The meter name, it namespaces the reduced keys.
    /// * `collective` - The worker group.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if the reduction fails.
    pub async fn synchronize<G: Collective>(
        &mut self,
        name: &str,
        collective: &mut G,
    ) -> Result<(), CollectiveError> {
        let count_key = format!("{name}/count");
        let total_key = format!("{name}/total");
        let local = ScalarMap::from([
            (count_key.clone(), self.count as f64),
            (total_key.clone(), self.total),
        ]);

        let global = collective.all_reduce(&local, false).await?;
        self.count = global[&count_key].round() as u64;
        self.total = global[&total_key];
        Ok(())
    }
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, MeterFormat::default())
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianGlobal => {
                write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
            }
            MeterFormat::Latest => write!(f, "{:.6}", self.value()),
        }
    }
}
