//! One pass over a loader: a training epoch or an evaluation.

use std::path::Path;

use log::{info, warn};

use crate::{
    config::RunConfig,
    dist::{Collective, ScalarMap},
    error::RunError,
    guard,
    losses::LossReport,
    metrics::{MeterFormat, MetricLogger, Progress, SmoothedValue},
    model::{Criterion, DataLoader, InputSpec, Model, Visualizer},
    optim::Optimizer,
};

const LR_METER: &str = "lr";

/// The per step settings of a run, resolved once.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    input: InputSpec,
    clip_max_norm: f64,
    print_freq: usize,
    window_size: usize,
}

impl Engine {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            input: config.input_spec(),
            clip_max_norm: config.clip_max_norm,
            print_freq: config.print_freq,
            window_size: config.window_size,
        }
    }

    fn meters<O, C: Criterion<O>>(&self, criterion: &C) -> MetricLogger {
        let mut metrics = MetricLogger::new();
        metrics.declare(
            LossReport::meter_names(&criterion.loss_names(), criterion.weight_dict()),
            self.window_size,
        );
        metrics
    }

    /// Trains `model` for one epoch over this worker's shard.
    ///
    /// Every step computes the loss, rejects it if it isn't finite, then
    /// backpropagates, clips and updates. Metrics are synchronized across the
    /// group once, after the last step.
    ///
    /// # Returns
    /// The epoch's global averages, identical on every worker.
    ///
    /// # Errors
    /// Returns a `RunError` on divergence or on any collaborator, optimizer or
    /// collective failure. Nothing is updated by the failing step.
    #[allow(clippy::too_many_arguments)]
    pub async fn train_one_epoch<M, C, L, O, G>(
        &self,
        model: &mut M,
        criterion: &C,
        loader: &L,
        optimizer: &mut O,
        collective: &mut G,
        epoch: usize,
    ) -> Result<ScalarMap, RunError>
    where
        M: Model,
        C: Criterion<M::Output>,
        L: DataLoader,
        O: Optimizer,
        G: Collective,
    {
        model.set_training(true);

        let mut metrics = self.meters(criterion);
        metrics.add_meter(LR_METER, SmoothedValue::new(1, MeterFormat::Latest));

        let mut progress = Progress::new(format!("Epoch: [{epoch}]"), loader.len(), self.print_freq);
        for batch in loader.batches() {
            let mut batch = batch?;
            progress.loaded();
            batch.place_with(|t| model.place(t));

            let output = model.forward(self.input.select(&batch)?)?;
            let terms = criterion.compute(&output, &batch)?;
            let report = LossReport::new(&terms, criterion.weight_dict());
            guard::check(report.total, &report.unscaled)?;

            optimizer.zero_grad(model.params_mut());
            model.backward(&criterion.backward(&output, &batch)?)?;
            if self.clip_max_norm > 0. {
                model.params_mut().clip_grad_norm(self.clip_max_norm);
            }
            optimizer.step(model.params_mut())?;

            metrics.update_all(&report.meters())?;
            let lr = optimizer.lrs().first().copied().unwrap_or(f64::NAN);
            metrics.update(LR_METER, lr)?;
            progress.step_done(&metrics);
        }
        progress.finish();

        metrics.synchronize(collective).await?;
        info!("Averaged stats: {metrics}");
        Ok(metrics.global_averages())
    }

    /// Evaluates `model` over this worker's shard.
    ///
    /// Non-finite losses are only reported. When `visualizer` is given, each
    /// batch's predictions are rendered into its directory.
    ///
    /// # Returns
    /// The global averages, identical on every worker.
    ///
    /// # Errors
    /// Returns a `RunError` on any collaborator or collective failure.
    pub async fn evaluate<M, C, L, V, G>(
        &self,
        model: &mut M,
        criterion: &C,
        loader: &L,
        mut visualizer: Option<(&mut V, &Path)>,
        collective: &mut G,
    ) -> Result<ScalarMap, RunError>
    where
        M: Model,
        C: Criterion<M::Output>,
        L: DataLoader,
        V: Visualizer<M::Output>,
        G: Collective,
    {
        model.set_training(false);

        let mut metrics = self.meters(criterion);
        let mut progress = Progress::new("Test:", loader.len(), self.print_freq);
        for batch in loader.batches() {
            let mut batch = batch?;
            progress.loaded();
            batch.place_with(|t| model.place(t));

            let output = model.forward(self.input.select(&batch)?)?;
            let terms = criterion.compute(&output, &batch)?;
            let report = LossReport::new(&terms, criterion.weight_dict());
            if !report.total.is_finite() {
                warn!("evaluation loss is {}: {:?}", report.total, report.unscaled);
            }

            if let Some((vis, dir)) = visualizer.as_mut() {
                vis.render(&output, &batch, dir)?;
            }

            metrics.update_all(&report.meters())?;
            progress.step_done(&metrics);
        }
        progress.finish();

        metrics.synchronize(collective).await?;
        info!("Averaged stats: {metrics}");
        Ok(metrics.global_averages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dist::SingleProcess,
        optim::{AdamW, OptimError, OptimizerState, param_groups},
        params::ParamStore,
        synthetic::{self, BoxCriterion, LinearGrounder, ShardedLoader, TaskDims},
    };

    /// AdamW that records the global gradient norm it is handed at every step.
    struct NormRecorder {
        inner: AdamW,
        norms: Vec<f64>,
    }

    impl Optimizer for NormRecorder {
        fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
            self.norms.push(params.grad_norm());
            self.inner.step(params)
        }

        fn lrs(&self) -> Vec<f64> {
            self.inner.lrs()
        }

        fn set_lr(&mut self, group: usize, lr: f64) {
            self.inner.set_lr(group, lr);
        }

        fn state(&self) -> OptimizerState {
            self.inner.state()
        }

        fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimError> {
            self.inner.load_state(state)
        }
    }

    async fn step_norms(clip_max_norm: f64) -> Vec<f64> {
        let config = RunConfig {
            clip_max_norm,
            batch_size: 4,
            output_dir: None,
            ..Default::default()
        };
        let dims = TaskDims::default();
        let mut collective = SingleProcess::new();
        let ctx = *collective.context();
        let loader = ShardedLoader::new(synthetic::generate(12, dims, 3), 4, dims.qvec_dim, &ctx, 3, false);
        let mut model = LinearGrounder::new(dims, 3);
        let groups = param_groups(model.params(), config.lr, config.lr_backbone, config.weight_decay);
        let mut optimizer = NormRecorder {
            inner: AdamW::with_defaults(model.params(), groups).unwrap(),
            norms: Vec::new(),
        };

        Engine::new(&config)
            .train_one_epoch(&mut model, &BoxCriterion::new(5.), &loader, &mut optimizer, &mut collective, 0)
            .await
            .unwrap();
        optimizer.norms
    }

    #[tokio::test]
    async fn non_positive_threshold_leaves_gradients_alone() {
        const MAX_NORM: f64 = 1e-3;

        let off = step_norms(0.).await;
        assert_eq!(off.len(), 3);
        assert_eq!(step_norms(-1.).await, off);
        assert!(off[0] > MAX_NORM);

        let clipped = step_norms(MAX_NORM).await;
        assert_eq!(clipped.len(), 3);
        assert!(clipped[0] < off[0]);
        assert!(clipped.iter().all(|norm| *norm <= MAX_NORM * (1. + 1e-5)));
    }
}
