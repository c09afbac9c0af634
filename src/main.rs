use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, error, info};

use grounding_orchestration::{
    Orchestrator, RunConfig,
    dist::{CoordContext, TcpCollective, master_addr_from_env},
    model::LanguageField,
    synthetic::{self, BoxCriterion, JsonlVisualizer, LinearGrounder, ShardedLoader, TaskDims},
};

/// Trains the grounding model on this worker. The worker group is described by
/// the `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT` variables.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// JSON run configuration, flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    lab_name: Option<String>,
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Evaluate the resumed model only.
    #[arg(long)]
    eval: bool,
    #[arg(long)]
    visualize_dir: Option<PathBuf>,
    /// Feed raw sentences to the model instead of query vectors.
    #[arg(long)]
    sentences: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Size of the synthetic training set.
    #[arg(long, default_value_t = 512)]
    train_samples: usize,
    /// Size of the synthetic test set.
    #[arg(long, default_value_t = 128)]
    test_samples: usize,
    /// Upper bound in seconds for joining the worker group.
    #[arg(long, default_value_t = 300)]
    timeout: u64,
    /// Upper bound in seconds for each metric reduction. Unbounded by default,
    /// a crashed peer fails the reduction anyway.
    #[arg(long)]
    reduce_timeout: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => RunConfig::default(),
        };

        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(lab_name) = self.lab_name {
            config.lab_name = lab_name;
        }
        if self.output_dir.is_some() {
            config.output_dir = self.output_dir;
        }
        if self.resume.is_some() {
            config.resume = self.resume;
        }
        if self.visualize_dir.is_some() {
            config.visualize_dir = self.visualize_dir;
        }
        if self.sentences {
            config.language = LanguageField::Sentences;
        }
        config.eval |= self.eval;

        config.validate()?;
        Ok(config)
    }
}

/// Quiet on every worker but the coordinator unless `RUST_LOG` says otherwise.
fn init_logging(ctx: &CoordContext) {
    let default = if ctx.is_coordinator() {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(default)
        .parse_default_env()
        .init();
}

async fn run(args: Args, ctx: CoordContext) -> anyhow::Result<()> {
    let limit = Duration::from_secs(args.timeout);
    let reduce_limit = args.reduce_timeout.map(Duration::from_secs);
    let (train_samples, test_samples) = (args.train_samples, args.test_samples);
    let config = args.into_config()?;

    let addr = master_addr_from_env()?;
    if ctx.is_distributed() {
        info!("| distributed init (rank {}): {addr}", ctx.rank());
    } else {
        info!("Not using distributed mode");
    }
    let collective = TcpCollective::connect(ctx, addr, limit)
        .await
        .context("joining the worker group")?
        .with_reduce_timeout(reduce_limit);

    let dims = TaskDims::default();
    let train = synthetic::generate(train_samples, dims, config.seed);
    let test = synthetic::generate(test_samples, dims, config.seed + 1);
    let train_loader = ShardedLoader::new(train, config.batch_size, dims.qvec_dim, &ctx, config.seed, true);
    let test_loader = ShardedLoader::new(test, config.batch_size, dims.qvec_dim, &ctx, config.seed, false);

    let model = LinearGrounder::new(dims, config.seed);
    let criterion = BoxCriterion::new(5.);

    let summary = Orchestrator::new(config, collective, model, criterion, train_loader, test_loader)
        .with_visualizer(JsonlVisualizer)
        .run()
        .await?;

    if let Some(stats) = summary.eval_stats {
        info!("evaluation: {}", serde_json::to_string(&stats)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let ctx = match CoordContext::from_env() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&ctx);

    match run(args, ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
