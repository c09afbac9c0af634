use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use log::info;

use super::{MeterFormat, MetricsError, SmoothedValue};
use crate::dist::{Collective, CollectiveError, ScalarMap};

/// A canonical set of named meters.
///
/// Every worker of a run must declare the same meters: synchronization reduces
/// each declared meter, including the ones this worker never updated, so that
/// all workers issue the same sequence of reductions.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a meter, replacing any meter with the same name.
    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    /// Declares one default meter per name.
    ///
    /// # Arguments
    /// * `names` - Meter names.
    /// * `window_size` - The smoothing window of each meter.
    pub fn declare<I, S>(&mut self, names: I, window_size: usize)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.meters
                .entry(name.into())
                .or_insert_with(|| SmoothedValue::new(window_size, MeterFormat::MedianGlobal));
        }
    }

    /// Records one observation of `name`.
    ///
    /// # Errors
    /// Returns `MetricsError::UnknownMeter` if `name` wasn't declared.
    pub fn update(&mut self, name: &str, value: f64) -> Result<(), MetricsError> {
        self.update_weighted(name, value, 1)
    }

    /// Records one observation of `name` that counts `weight` times in the
    /// running average.
    ///
    /// # Errors
    /// Returns `MetricsError::UnknownMeter` if `name` wasn't declared.
    pub fn update_weighted(&mut self, name: &str, value: f64, weight: u64) -> Result<(), MetricsError> {
        let meter = self
            .meters
            .get_mut(name)
            .ok_or_else(|| MetricsError::UnknownMeter(name.to_string()))?;

        meter.update(value, weight);
        Ok(())
    }

    /// Records one observation per entry of `values`.
    ///
    /// # Errors
    /// Returns `MetricsError::UnknownMeter` on the first undeclared name.
    pub fn update_all(&mut self, values: &ScalarMap) -> Result<(), MetricsError> {
        values
            .iter()
            .try_for_each(|(name, value)| self.update(name, *value))
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// The mean of the recent window of `name`, local to this worker.
    pub fn window_average(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::avg)
    }

    /// The running average of `name`, exact across workers after `synchronize`.
    pub fn global_average(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::global_avg)
    }

    /// The running average of every meter.
    pub fn global_averages(&self) -> ScalarMap {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    /// Makes every meter's running count and total equal to the sums over the
    /// whole worker group. Acts as a barrier: one reduction per meter, in name
    /// order.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if any reduction fails.
    pub async fn synchronize<G: Collective>(&mut self, collective: &mut G) -> Result<(), CollectiveError> {
        for (name, meter) in self.meters.iter_mut() {
            meter.synchronize(name, collective).await?;
        }

        Ok(())
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (name, meter) in &self.meters {
            if !first {
                f.write_str("  ")?;
            }
            write!(f, "{name}: {meter}")?;
            first = false;
        }

        Ok(())
    }
}

/// Periodic progress lines of a pass over a loader.
pub struct Progress {
    header: String,
    total: usize,
    print_freq: usize,
    index: usize,
    start: Instant,
    last: Instant,
    loaded_at: Instant,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
}

impl Progress {
    /// Starts tracking a pass.
    ///
    /// # Arguments
    /// * `header` - Prefix of every line, e.g. `Epoch: [3]` or `Test:`.
    /// * `total` - Amount of steps in the pass, used for the ETA.
    /// * `print_freq` - A line is logged every `print_freq` steps and on the last one.
    pub fn new(header: impl Into<String>, total: usize, print_freq: usize) -> Self {
        let now = Instant::now();

        Self {
            header: header.into(),
            total,
            print_freq: print_freq.max(1),
            index: 0,
            start: now,
            last: now,
            loaded_at: now,
            iter_time: SmoothedValue::default(),
            data_time: SmoothedValue::default(),
        }
    }

    /// Marks that the next batch is available.
    pub fn loaded(&mut self) {
        self.loaded_at = Instant::now();
        self.data_time
            .update((self.loaded_at - self.last).as_secs_f64(), 1);
    }

    /// Marks the end of a step, logging a progress line when due.
    pub fn step_done(&mut self, meters: &MetricLogger) {
        let now = Instant::now();
        self.iter_time.update((now - self.last).as_secs_f64(), 1);
        self.last = now;

        if self.index % self.print_freq == 0 || self.index + 1 == self.total {
            let remaining = self.total.saturating_sub(self.index + 1) as f64;
            let eta = Duration::from_secs_f64(self.iter_time.global_avg() * remaining);
            let width = self.total.to_string().len();

            info!(
                "{} [{:>width$}/{}]  eta: {}  {}  time: {:.4}  data: {:.4}",
                self.header,
                self.index,
                self.total,
                fmt_duration(eta),
                meters,
                self.iter_time.value(),
                self.data_time.value(),
            );
        }

        self.index += 1;
    }

    /// Logs the wall time of the whole pass.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        let per_step = elapsed.as_secs_f64() / self.index.max(1) as f64;

        info!(
            "{} Total time: {} ({per_step:.4} s / it)",
            self.header,
            fmt_duration(elapsed)
        );
        elapsed
    }
}

/// Renders `d` as `H:MM:SS`.
pub fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
