use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{debug, info};
use serde_json::{Map, Value};

use crate::{
    checkpoint::{self, CheckpointManager, RunState},
    config::RunConfig,
    dist::{Collective, ScalarMap},
    engine::Engine,
    error::RunError,
    metrics::fmt_duration,
    model::{Batch, Criterion, DataLoader, Model, ModelError, Visualizer},
    optim::{AdamW, LrScheduler, Optimizer, StepLr, param_groups},
};

pub const LOG_FILE: &str = "log.txt";

const LR_GAMMA: f64 = 0.1;

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    TrainingEpoch(usize),
    Checkpointed(usize),
    Evaluating(usize),
    Finished,
}

/// The record appended to the run log after each epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: ScalarMap,
    pub test: ScalarMap,
    pub n_parameters: usize,
}

impl EpochRecord {
    /// `train_<meter>`, `test_<meter>`, `epoch` and `n_parameters` in one flat object.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        record.extend(self.train.iter().map(|(k, v)| (format!("train_{k}"), Value::from(*v))));
        record.extend(self.test.iter().map(|(k, v)| (format!("test_{k}"), Value::from(*v))));
        record.insert("epoch".into(), self.epoch.into());
        record.insert("n_parameters".into(), self.n_parameters.into());
        Value::Object(record)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub n_parameters: usize,
    pub start_epoch: usize,
    /// One record per trained epoch.
    pub records: Vec<EpochRecord>,
    /// The stats of an evaluation-only run.
    pub eval_stats: Option<ScalarMap>,
    pub elapsed: Duration,
}

/// A visualizer for runs that render nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVisualizer;

impl<O> Visualizer<O> for NoVisualizer {
    fn render(&mut self, _output: &O, _batch: &Batch, _dir: &Path) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Drives the epochs of one worker: train, checkpoint, evaluate, log.
pub struct Orchestrator<M, C, L, V, G> {
    config: RunConfig,
    collective: G,
    model: M,
    criterion: C,
    train_loader: L,
    test_loader: L,
    visualizer: Option<V>,
    phase: Phase,
}

impl<M, C, L, G> Orchestrator<M, C, L, NoVisualizer, G>
where
    M: Model,
    C: Criterion<M::Output>,
    L: DataLoader,
    G: Collective,
{
    /// # Arguments
    /// * `config` - A validated run configuration.
    /// * `collective` - This worker's membership in the run.
    /// * `model`, `criterion` - What is trained and how it is scored.
    /// * `train_loader`, `test_loader` - This worker's shards.
    pub fn new(config: RunConfig, collective: G, model: M, criterion: C, train_loader: L, test_loader: L) -> Self {
        Self {
            config,
            collective,
            model,
            criterion,
            train_loader,
            test_loader,
            visualizer: None,
            phase: Phase::Initializing,
        }
    }
}

impl<M, C, L, V, G> Orchestrator<M, C, L, V, G>
where
    M: Model,
    C: Criterion<M::Output>,
    L: DataLoader,
    V: Visualizer<M::Output>,
    G: Collective,
{
    /// Renders the predictions of an evaluation-only run with `visualizer` when
    /// the configuration names a visualization directory.
    pub fn with_visualizer<W: Visualizer<M::Output>>(self, visualizer: W) -> Orchestrator<M, C, L, W, G> {
        Orchestrator {
            config: self.config,
            collective: self.collective,
            model: self.model,
            criterion: self.criterion,
            train_loader: self.train_loader,
            test_loader: self.test_loader,
            visualizer: Some(visualizer),
            phase: self.phase,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs to completion.
    ///
    /// # Errors
    /// Returns the first fatal `RunError`. The worker group is aborted first,
    /// so that peers fail instead of waiting for this worker.
    pub async fn run(&mut self) -> Result<RunSummary, RunError> {
        let result = self.drive().await;

        if let Err(e) = &result {
            self.collective.abort(&e.to_string()).await;
        }
        result
    }

    fn enter(&mut self, phase: Phase) {
        debug!(rank = self.collective.context().rank(); "{:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    async fn drive(&mut self) -> Result<RunSummary, RunError> {
        self.config.validate()?;

        let ctx = *self.collective.context();
        let engine = Engine::new(&self.config);
        let started = Instant::now();

        info!(
            rank = ctx.rank(), world_size = ctx.world_size();
            "worker seed {}", self.config.seed + ctx.rank() as u64
        );

        let n_parameters = self.model.params().n_trainable();
        info!("number of params: {n_parameters}");

        let groups = param_groups(
            self.model.params(),
            self.config.lr,
            self.config.lr_backbone,
            self.config.weight_decay,
        );
        let mut optimizer = AdamW::with_defaults(self.model.params(), groups)?;
        let mut scheduler = StepLr::new(&optimizer, self.config.lr_drop, LR_GAMMA);

        let run_dir = self.config.run_dir();
        let vis_dir = self
            .config
            .visualize_path()
            .filter(|_| self.config.eval && ctx.is_coordinator());
        if ctx.is_coordinator() {
            for dir in run_dir.iter().chain(&vis_dir) {
                fs::create_dir_all(dir)?;
            }
        }
        let checkpoints = run_dir.as_ref().map(|dir| {
            CheckpointManager::new(
                ctx,
                dir.clone(),
                self.config.snapshot_every,
                self.config.lr_drop,
            )
        });

        let mut start_epoch = self.config.start_epoch;
        if let Some(path) = self.config.resume.clone() {
            let restored = checkpoint::load(
                &path,
                self.model.params_mut(),
                &mut optimizer,
                &mut scheduler,
                !self.config.eval,
            )?;
            start_epoch = restored.start_epoch(self.config.start_epoch);
        }

        if self.config.eval {
            self.enter(Phase::Evaluating(start_epoch));
            let stats = self.evaluate(&engine, vis_dir).await?;
            self.enter(Phase::Finished);

            return Ok(RunSummary {
                n_parameters,
                start_epoch,
                records: Vec::new(),
                eval_stats: Some(stats),
                elapsed: started.elapsed(),
            });
        }

        info!("Start training");
        let mut records = Vec::new();
        for epoch in start_epoch..self.config.epochs {
            self.enter(Phase::TrainingEpoch(epoch));
            self.train_loader.set_epoch(epoch);
            let train = engine
                .train_one_epoch(
                    &mut self.model,
                    &self.criterion,
                    &self.train_loader,
                    &mut optimizer,
                    &mut self.collective,
                    epoch,
                )
                .await?;
            scheduler.step(&mut optimizer);

            if let Some(checkpoints) = &checkpoints {
                let state = RunState {
                    params: self.model.params(),
                    optimizer: optimizer.state(),
                    lr_scheduler: scheduler.state(),
                    epoch,
                    config: self.config.to_json()?,
                };
                checkpoints.save_epoch(&state)?;
                self.enter(Phase::Checkpointed(epoch));
            }

            self.enter(Phase::Evaluating(epoch));
            let test = self.evaluate(&engine, None).await?;

            let record = EpochRecord {
                epoch,
                train,
                test,
                n_parameters,
            };
            if let Some(dir) = run_dir.as_ref().filter(|_| ctx.is_coordinator()) {
                append_record(&dir.join(LOG_FILE), &record)?;
            }
            records.push(record);
        }
        self.enter(Phase::Finished);

        let elapsed = started.elapsed();
        info!("Training time {}", fmt_duration(elapsed));

        Ok(RunSummary {
            n_parameters,
            start_epoch,
            records,
            eval_stats: None,
            elapsed,
        })
    }

    async fn evaluate(&mut self, engine: &Engine, render_dir: Option<PathBuf>) -> Result<ScalarMap, RunError> {
        let visualizer = match (self.visualizer.as_mut(), render_dir.as_deref()) {
            (Some(vis), Some(dir)) => Some((vis, dir)),
            _ => None,
        };

        engine
            .evaluate(
                &mut self.model,
                &self.criterion,
                &self.test_loader,
                visualizer,
                &mut self.collective,
            )
            .await
    }
}

fn append_record(path: &Path, record: &EpochRecord) -> Result<(), RunError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", record.to_json())?;
    Ok(())
}
