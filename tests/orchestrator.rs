use std::{
    fs,
    num::NonZeroUsize,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use grounding_orchestration::{
    Orchestrator, Phase, RunConfig, RunError, RunSummary,
    dist::{Collective, CollectiveError, CoordContext, LocalGroup, ScalarMap, TcpCollective},
    model::{Batch, Criterion, Model, ModelError, Tensor, Visualizer, WeightDict},
    orchestrator::LOG_FILE,
    synthetic::{self, BoxCriterion, JsonlVisualizer, LinearGrounder, ShardedLoader, TaskDims},
};
use tokio::net::TcpListener;

const SEED: u64 = 11;

fn config(output_dir: &Path, epochs: usize) -> RunConfig {
    RunConfig {
        epochs,
        batch_size: 4,
        lr: 1e-2,
        lr_drop: 2,
        output_dir: Some(output_dir.to_path_buf()),
        seed: SEED,
        print_freq: 1,
        ..Default::default()
    }
}

fn loaders(config: &RunConfig, ctx: &CoordContext) -> (ShardedLoader, ShardedLoader) {
    let dims = TaskDims::default();
    let train = synthetic::generate(24, dims, config.seed);
    let test = synthetic::generate(12, dims, config.seed + 1);

    (
        ShardedLoader::new(train, config.batch_size, dims.qvec_dim, ctx, config.seed, true),
        ShardedLoader::new(test, config.batch_size, dims.qvec_dim, ctx, config.seed, false),
    )
}

/// The box criterion, except that one chosen training step yields a NaN loss.
struct Diverging {
    inner: BoxCriterion,
    at_step: Option<usize>,
    calls: AtomicUsize,
}

impl Diverging {
    fn new(at_step: Option<usize>) -> Self {
        Self {
            inner: BoxCriterion::new(5.),
            at_step,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Criterion<Tensor> for Diverging {
    fn loss_names(&self) -> Vec<String> {
        self.inner.loss_names()
    }

    fn weight_dict(&self) -> &WeightDict {
        self.inner.weight_dict()
    }

    fn compute(&self, output: &Tensor, batch: &Batch) -> Result<ScalarMap, ModelError> {
        let mut terms = self.inner.compute(output, batch)?;
        if self.at_step == Some(self.calls.fetch_add(1, Ordering::SeqCst)) {
            terms.insert(BoxCriterion::L1.to_string(), f64::NAN);
        }
        Ok(terms)
    }

    fn backward(&self, output: &Tensor, batch: &Batch) -> Result<Tensor, ModelError> {
        self.inner.backward(output, batch)
    }
}

async fn run_group(config: RunConfig, world: usize) -> Vec<RunSummary> {
    let mut handles = Vec::new();

    for member in LocalGroup::new(NonZeroUsize::new(world).unwrap()) {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let ctx = *member.context();
            let (train, test) = loaders(&config, &ctx);
            let model = LinearGrounder::new(TaskDims::default(), config.seed);
            let criterion = BoxCriterion::new(5.);

            Orchestrator::new(config, member, model, criterion, train, test)
                .run()
                .await
        }));
    }

    let mut summaries = Vec::new();
    for handle in handles {
        summaries.push(handle.await.unwrap().unwrap());
    }
    summaries
}

fn log_lines(run_dir: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(run_dir.join(LOG_FILE))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_agree_on_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 3);
    let run_dir = config.run_dir().unwrap();

    let summaries = run_group(config, 3).await;

    for summary in &summaries {
        assert_eq!(summary.records, summaries[0].records);
        assert_eq!(summary.n_parameters, 68);
    }

    let records = &summaries[0].records;
    assert_eq!(records.len(), 3);
    assert_eq!(records.last().unwrap().epoch, 2);
    assert!(records[0].train["loss"].is_finite());
    assert!(records[0].train.contains_key("loss_l2_unscaled"));
    assert!((records[2].train["lr"] - 1e-3).abs() < 1e-12);

    let lines = log_lines(&run_dir);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["epoch"], 2);
    assert_eq!(lines[2]["n_parameters"], 68);
    assert!(lines[0]["test_loss_bbox"].is_number());

    assert!(run_dir.join("checkpoint.safetensors").exists());
    assert!(run_dir.join("checkpoint0002.safetensors").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumed_run_continues_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let first = config(dir.path(), 2);
    let run_dir = first.run_dir().unwrap();
    run_group(first.clone(), 2).await;

    let resumed = RunConfig {
        epochs: 4,
        resume: Some(run_dir.join("checkpoint.safetensors")),
        ..first.clone()
    };
    let summaries = run_group(resumed.clone(), 2).await;

    assert_eq!(summaries[0].start_epoch, 2);
    let epochs: Vec<_> = summaries[0].records.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, [2, 3]);
    assert_eq!(log_lines(&run_dir).len(), 4);

    let eval = RunConfig {
        eval: true,
        ..resumed
    };
    let summaries = run_group(eval, 2).await;
    assert!(summaries[0].records.is_empty());
    assert!(summaries[0].eval_stats.as_ref().unwrap()["loss"].is_finite());
    assert_eq!(summaries[0].eval_stats, summaries[1].eval_stats);
    assert_eq!(log_lines(&run_dir).len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergence_on_one_worker_stops_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 3);
    let dims = TaskDims::default();

    let mut handles = Vec::new();
    for member in LocalGroup::new(NonZeroUsize::new(3).unwrap()) {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let ctx = *member.context();
            let (train, test) = loaders(&config, &ctx);
            let at_step = (ctx.rank() == 1).then_some(0);
            let model = LinearGrounder::new(dims, config.seed);

            let mut orchestrator = Orchestrator::new(config, member, model, Diverging::new(at_step), train, test);
            let result = orchestrator.run().await;
            (ctx.rank(), result, orchestrator.model().params().clone())
        }));
    }

    let initial = LinearGrounder::new(dims, SEED);
    for handle in handles {
        let (rank, result, params) = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("a worker hung after the divergence")
            .unwrap();

        match rank {
            1 => {
                assert!(matches!(result, Err(RunError::Divergence(d)) if d.loss.is_nan()));
                assert_eq!(&params, initial.params());
            }
            _ => assert!(matches!(
                result,
                Err(RunError::Collective(CollectiveError::Aborted(_)))
            )),
        }
    }

    assert!(!config.run_dir().unwrap().join(LOG_FILE).exists());
}

async fn run_single<V>(config: RunConfig, visualizer: V) -> (Phase, RunSummary)
where
    V: Visualizer<Tensor>,
{
    let member = LocalGroup::new(NonZeroUsize::MIN).remove(0);
    let ctx = *member.context();
    let (train, test) = loaders(&config, &ctx);
    let model = LinearGrounder::new(TaskDims::default(), config.seed);

    let mut orchestrator = Orchestrator::new(config, member, model, BoxCriterion::new(5.), train, test)
        .with_visualizer(visualizer);
    let summary = orchestrator.run().await.unwrap();
    (orchestrator.phase(), summary)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_evaluation_runs_render_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let training = RunConfig {
        visualize_dir: Some("vis".into()),
        ..config(dir.path(), 2)
    };
    let vis_dir = training.visualize_path().unwrap();

    let (phase, summary) = run_single(training.clone(), JsonlVisualizer).await;
    assert_eq!(phase, Phase::Finished);
    assert_eq!(summary.records.len(), 2);
    assert!(!vis_dir.exists());

    let eval = RunConfig {
        eval: true,
        resume: Some(training.run_dir().unwrap().join("checkpoint.safetensors")),
        ..training
    };
    let (phase, summary) = run_single(eval, JsonlVisualizer).await;
    assert_eq!(phase, Phase::Finished);
    assert!(summary.eval_stats.is_some());

    let rendered = fs::read_to_string(vis_dir.join("predictions.jsonl")).unwrap();
    assert_eq!(rendered.lines().count(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_train_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        output_dir: None,
        ..config(dir.path(), 2)
    };
    let limit = Duration::from_secs(10);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let world = NonZeroUsize::new(2).unwrap();

    let spoke_config = config.clone();
    let spoke = tokio::spawn(async move {
        let ctx = CoordContext::new(1, world).unwrap();
        let collective = TcpCollective::join(addr, ctx, limit).await.unwrap();
        let (train, test) = loaders(&spoke_config, &ctx);
        let model = LinearGrounder::new(TaskDims::default(), spoke_config.seed);

        Orchestrator::new(spoke_config, collective, model, BoxCriterion::new(5.), train, test)
            .run()
            .await
    });

    let collective = TcpCollective::host(listener, world, limit).await.unwrap();
    let ctx = *collective.context();
    let (train, test) = loaders(&config, &ctx);
    let model = LinearGrounder::new(TaskDims::default(), config.seed);
    let hub = Orchestrator::new(config, collective, model, BoxCriterion::new(5.), train, test)
        .run()
        .await
        .unwrap();

    let spoke = spoke.await.unwrap().unwrap();
    assert_eq!(hub.records, spoke.records);
    assert_eq!(hub.records.len(), 2);
    assert!(!dir.path().join("vg").exists());
}
