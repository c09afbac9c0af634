//! Persistence of the run state: model parameters, optimizer and scheduler
//! state, and the last finished epoch, in a single safetensors file.
//!
//! Tensors are stored as `model.<param>` and `optimizer.<buffer>.<param>`,
//! scalars as JSON strings in the file metadata. Tensors without either
//! prefix are read as model parameters so that bare weight exports load too.

use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::{info, warn};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{
    dist::CoordContext,
    model::{ModelError, Tensor},
    optim::{LrScheduler, OptimError, Optimizer, OptimizerState},
    params::ParamStore,
};

pub const FORMAT: &str = "grounding-run/1";
pub const LATEST: &str = "checkpoint.safetensors";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

const FORMAT_KEY: &str = "format";
const EPOCH_KEY: &str = "epoch";
const OPTIMIZER_KEY: &str = "optimizer";
const SCHEDULER_KEY: &str = "lr_scheduler";
const CONFIG_KEY: &str = "config";

#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: io::Error },
    /// The file isn't a readable checkpoint.
    Format(String),
    /// A stored parameter doesn't fit the model.
    Model(ModelError),
    /// The stored optimizer or scheduler state doesn't fit this run.
    Optim(OptimError),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Format(detail) => write!(f, "malformed checkpoint: {detail}"),
            Self::Model(e) => write!(f, "{e}"),
            Self::Optim(e) => write!(f, "{e}"),
        }
    }
}

impl Error for CheckpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Model(e) => Some(e),
            Self::Optim(e) => Some(e),
            Self::Format(_) => None,
        }
    }
}

impl From<safetensors::SafeTensorError> for CheckpointError {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Format(value.to_string())
    }
}

impl From<ModelError> for CheckpointError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}

impl From<OptimError> for CheckpointError {
    fn from(value: OptimError) -> Self {
        Self::Optim(value)
    }
}

/// A view of everything a checkpoint holds.
pub struct RunState<'a> {
    pub params: &'a ParamStore,
    pub optimizer: OptimizerState,
    pub lr_scheduler: serde_json::Value,
    /// The last finished epoch.
    pub epoch: usize,
    /// The configuration of the run that produced the state.
    pub config: serde_json::Value,
}

/// What `load` restored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restored {
    /// The epoch stored alongside the optimizer state, when it was resumed.
    pub epoch: Option<usize>,
    /// Model parameters absent from the file.
    pub missing: Vec<String>,
    /// Stored parameters the model doesn't have.
    pub unexpected: Vec<String>,
}

impl Restored {
    /// The first epoch to train: the one after the restored epoch, or
    /// `configured` when only weights were loaded.
    pub fn start_epoch(&self, configured: usize) -> usize {
        self.epoch.map_or(configured, |e| e + 1)
    }
}

/// Writes checkpoints of a run, on the coordinator only.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    ctx: CoordContext,
    dir: PathBuf,
    snapshot_every: usize,
    lr_drop: usize,
}

impl CheckpointManager {
    /// # Arguments
    /// * `ctx` - This worker's role, only the coordinator writes.
    /// * `dir` - Directory the checkpoints are written to.
    /// * `snapshot_every` - Epochs between numbered snapshots.
    /// * `lr_drop` - Epochs between learning rate decays, each one also gets a snapshot.
    pub fn new(ctx: CoordContext, dir: PathBuf, snapshot_every: usize, lr_drop: usize) -> Self {
        Self {
            ctx,
            dir,
            snapshot_every: snapshot_every.max(1),
            lr_drop: lr_drop.max(1),
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("checkpoint{epoch:04}.safetensors"))
    }

    /// Writes `state` to `path`.
    ///
    /// # Returns
    /// Whether anything was written, always `false` off the coordinator.
    ///
    /// # Errors
    /// Returns a `CheckpointError` if serializing or writing fails. The
    /// previous content of `path` is left intact in that case.
    pub fn save(&self, state: &RunState<'_>, path: &Path) -> Result<bool, CheckpointError> {
        if !self.ctx.is_coordinator() {
            return Ok(false);
        }

        write_atomic(path, &encode(state)?)?;
        Ok(true)
    }

    /// Writes the latest checkpoint and, when due, the numbered snapshot of
    /// `state.epoch`.
    ///
    /// # Returns
    /// The written paths.
    ///
    /// # Errors
    /// Returns a `CheckpointError` on the first failed write.
    pub fn save_epoch(&self, state: &RunState<'_>) -> Result<Vec<PathBuf>, CheckpointError> {
        if !self.ctx.is_coordinator() {
            return Ok(Vec::new());
        }

        let mut paths = vec![self.latest_path()];
        let next = state.epoch + 1;
        if next % self.snapshot_every == 0 || next % self.lr_drop == 0 {
            paths.push(self.epoch_path(state.epoch));
        }

        let bytes = encode(state)?;
        for path in &paths {
            write_atomic(path, &bytes)?;
        }

        info!(epoch = state.epoch; "saved {} checkpoint file(s)", paths.len());
        Ok(paths)
    }
}

fn encode(state: &RunState<'_>) -> Result<Vec<u8>, CheckpointError> {
    let mut entries: Vec<(String, &Tensor)> = state
        .params
        .iter()
        .map(|(name, p)| (format!("{MODEL_PREFIX}{name}"), &p.value))
        .collect();

    for (kind, buffers) in &state.optimizer.buffers {
        entries.extend(
            buffers
                .iter()
                .map(|(name, t)| (format!("{OPTIMIZER_PREFIX}{kind}.{name}"), t)),
        );
    }

    let views = entries
        .iter()
        .map(|(name, t)| {
            let view = TensorView::new(Dtype::F32, t.shape().to_vec(), bytemuck::cast_slice(t.data()))?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>, CheckpointError>>()?;

    let metadata = HashMap::from([
        (FORMAT_KEY.to_string(), FORMAT.to_string()),
        (EPOCH_KEY.to_string(), state.epoch.to_string()),
        (OPTIMIZER_KEY.to_string(), state.optimizer.scalars.to_string()),
        (SCHEDULER_KEY.to_string(), state.lr_scheduler.to_string()),
        (CONFIG_KEY.to_string(), state.config.to_string()),
    ]);

    Ok(safetensors::serialize(views, Some(metadata))?)
}

/// Writes `bytes` to a sibling temporary file, then renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }

    Ok(())
}

/// Loads a checkpoint into a model and, when resuming, into its optimizer and
/// scheduler.
///
/// Parameters are matched by name: missing and unexpected ones are logged,
/// shape mismatches fail. The optimizer, the scheduler and the epoch are
/// restored together, only if `resume_training` is set and the file holds all
/// three; otherwise they keep their fresh state.
///
/// # Errors
/// Returns a `CheckpointError` if the file can't be read, isn't a checkpoint,
/// or doesn't fit the model, optimizer or scheduler.
pub fn load(
    path: &Path,
    params: &mut ParamStore,
    optimizer: &mut dyn Optimizer,
    scheduler: &mut dyn LrScheduler,
    resume_training: bool,
) -> Result<Restored, CheckpointError> {
    let data = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let tensors = SafeTensors::deserialize(&data)?;
    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    if let Some(format) = metadata.get(FORMAT_KEY).filter(|f| *f != FORMAT) {
        return Err(CheckpointError::Format(format!("unsupported format {format:?}")));
    }

    let mut weights = BTreeMap::new();
    let mut buffers: BTreeMap<String, BTreeMap<String, Tensor>> = BTreeMap::new();

    for (name, view) in tensors.tensors() {
        let tensor = to_tensor(&name, &view)?;

        if let Some(rest) = name.strip_prefix(OPTIMIZER_PREFIX) {
            let (kind, param) = rest
                .split_once('.')
                .ok_or_else(|| CheckpointError::Format(format!("bad optimizer tensor {name:?}")))?;
            buffers
                .entry(kind.to_string())
                .or_default()
                .insert(param.to_string(), tensor);
        } else {
            let param = name.strip_prefix(MODEL_PREFIX).unwrap_or(&name);
            weights.insert(param.to_string(), tensor);
        }
    }

    let mut restored = Restored::default();
    let mut seen = Vec::with_capacity(weights.len());
    for (name, tensor) in weights {
        if params.assign(&name, tensor)? {
            seen.push(name);
        } else {
            restored.unexpected.push(name);
        }
    }
    restored.missing = params
        .iter()
        .map(|(name, _)| name)
        .filter(|name| !seen.contains(*name))
        .cloned()
        .collect();

    if !restored.missing.is_empty() {
        warn!("missing keys: {:?}", restored.missing);
    }
    if !restored.unexpected.is_empty() {
        warn!("unexpected keys: {:?}", restored.unexpected);
    }

    let resumable = (
        metadata.get(OPTIMIZER_KEY),
        metadata.get(SCHEDULER_KEY),
        metadata.get(EPOCH_KEY),
    );
    match resumable {
        (Some(optim), Some(sched), Some(epoch)) if resume_training => {
            let epoch = epoch
                .parse()
                .map_err(|e| CheckpointError::Format(format!("bad epoch {epoch:?}: {e}")))?;
            let scalars = serde_json::from_str(optim).map_err(OptimError::from)?;
            let sched = serde_json::from_str(sched).map_err(OptimError::from)?;

            optimizer.load_state(OptimizerState { scalars, buffers })?;
            scheduler.load_state(sched)?;
            restored.epoch = Some(epoch);
            info!(epoch = epoch; "resumed training state from {}", path.display());
        }
        (Some(_), Some(_), Some(_)) => {
            info!("loaded model weights only from {}", path.display());
        }
        _ => info!(
            "{} holds no training state, optimizer and scheduler start fresh",
            path.display()
        ),
    }

    Ok(restored)
}

fn to_tensor(name: &str, view: &TensorView<'_>) -> Result<Tensor, CheckpointError> {
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointError::Format(format!(
            "{name}: expected F32, found {:?}",
            view.dtype()
        )));
    }

    let data = view
        .data()
        .chunks_exact(size_of::<f32>())
        .map(bytemuck::pod_read_unaligned)
        .collect();
    Tensor::new(view.shape().to_vec(), data)
        .ok_or_else(|| CheckpointError::Format(format!("{name}: data doesn't match its shape")))
}
