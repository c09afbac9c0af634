//! Small deterministic collaborators: a box regression task that a linear
//! grounder can fit, used to drive whole runs end to end.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    dist::{CoordContext, ScalarMap},
    model::{
        Batch, Criterion, DataLoader, Field, LanguageInput, Model, ModelError, ModelInput, Tensor,
        Visualizer, WeightDict,
    },
    params::ParamStore,
};

pub const BOX_DIM: usize = 4;

const VOCAB: [&str; 8] = ["red", "dog", "left", "car", "tall", "man", "small", "cup"];

/// One grounding example: image features, a phrase and its target box.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub img: Vec<f32>,
    pub sentence: String,
    pub target: [f32; BOX_DIM],
}

/// Sizes of the synthetic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDims {
    pub img_dim: usize,
    pub qvec_dim: usize,
}

impl Default for TaskDims {
    fn default() -> Self {
        Self {
            img_dim: 8,
            qvec_dim: VOCAB.len(),
        }
    }
}

/// Embeds a phrase as counts over a fixed vocabulary, folded into `dim` slots.
pub fn embed_sentence(sentence: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.; dim.max(1)];
    let len = v.len();
    for word in sentence.split_whitespace() {
        if let Some(i) = VOCAB.iter().position(|w| *w == word) {
            v[i % len] += 1.;
        }
    }
    v
}

/// Generates `n` samples whose boxes are a fixed linear map of their inputs.
///
/// # Arguments
/// * `n` - Amount of samples.
/// * `dims` - Feature sizes.
/// * `seed` - Same seed, same samples on every worker.
pub fn generate(n: usize, dims: TaskDims, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let in_dim = dims.img_dim + dims.qvec_dim;
    let truth: Vec<f32> = (0..BOX_DIM * in_dim)
        .map(|_| rng.random_range(-0.5..0.5))
        .collect();

    (0..n)
        .map(|_| {
            let img: Vec<f32> = (0..dims.img_dim).map(|_| rng.random_range(0.0..1.0)).collect();
            let words: Vec<&str> = (0..2).map(|_| VOCAB[rng.random_range(0..VOCAB.len())]).collect();
            let sentence = words.join(" ");
            let qvec = embed_sentence(&sentence, dims.qvec_dim);

            let mut target = [0.; BOX_DIM];
            for (k, t) in target.iter_mut().enumerate() {
                let row = &truth[k * in_dim..(k + 1) * in_dim];
                *t = row
                    .iter()
                    .zip(img.iter().chain(&qvec))
                    .map(|(w, x)| w * x)
                    .sum();
            }

            Sample {
                img,
                sentence,
                target,
            }
        })
        .collect()
}

/// Serves this worker's shard of a sample set in batches.
///
/// Each epoch the whole set is permuted with `seed + epoch`, identically on
/// every worker, and worker `r` keeps every `world_size`-th sample starting
/// at `r`.
#[derive(Debug, Clone)]
pub struct ShardedLoader {
    samples: Vec<Sample>,
    batch_size: usize,
    qvec_dim: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
    order: Vec<usize>,
}

impl ShardedLoader {
    pub fn new(
        samples: Vec<Sample>,
        batch_size: usize,
        qvec_dim: usize,
        ctx: &CoordContext,
        seed: u64,
        shuffle: bool,
    ) -> Self {
        let mut loader = Self {
            order: Vec::new(),
            samples,
            batch_size: batch_size.max(1),
            qvec_dim,
            rank: ctx.rank(),
            world_size: ctx.world_size(),
            seed,
            shuffle,
        };
        loader.set_epoch(0);
        loader
    }

    fn batch(&self, indices: &[usize]) -> Batch {
        let picked: Vec<&Sample> = indices.iter().map(|i| &self.samples[*i]).collect();
        let b = picked.len();
        let img_dim = picked.first().map_or(0, |s| s.img.len());

        let img = picked.iter().flat_map(|s| s.img.iter().copied()).collect();
        let qvec = picked
            .iter()
            .flat_map(|s| embed_sentence(&s.sentence, self.qvec_dim))
            .collect();
        let boxes = picked.iter().flat_map(|s| s.target).collect();
        let sents = picked.iter().map(|s| s.sentence.clone()).collect();

        let mut batch = Batch::new().with("sents", Field::Text(sents)).with(
            "ids",
            Field::Ids(indices.iter().map(|i| *i as u64).collect()),
        );
        for (name, shape, data) in [
            ("img", vec![b, img_dim], img),
            ("qvec", vec![b, self.qvec_dim], qvec),
            ("boxes", vec![b, BOX_DIM], boxes),
        ] {
            if let Some(t) = Tensor::new(shape, data) {
                batch.insert(name, Field::Tensor(t));
            }
        }
        batch
    }
}

impl DataLoader for ShardedLoader {
    fn set_epoch(&mut self, epoch: usize) {
        let mut all: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            all.shuffle(&mut StdRng::seed_from_u64(self.seed + epoch as u64));
        }

        self.order = all
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect();
    }

    fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn batches(&self) -> impl Iterator<Item = Result<Batch, ModelError>> + '_ {
        self.order
            .chunks(self.batch_size)
            .map(|indices| Ok(self.batch(indices)))
    }
}

/// `boxes = img · backbone.weightᵀ + qvec · bbox_embed.weightᵀ + bbox_embed.bias`
#[derive(Debug, Clone)]
pub struct LinearGrounder {
    params: ParamStore,
    dims: TaskDims,
    training: bool,
    last_img: Option<Tensor>,
    last_qvec: Option<Tensor>,
}

impl LinearGrounder {
    pub const BACKBONE: &'static str = "backbone.weight";
    pub const WEIGHT: &'static str = "bbox_embed.weight";
    pub const BIAS: &'static str = "bbox_embed.bias";

    /// A grounder with small random weights drawn from `seed`.
    pub fn new(dims: TaskDims, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut random = |rows: usize, cols: usize| {
            let data = (0..rows * cols).map(|_| rng.random_range(-0.1..0.1)).collect();
            Tensor::new(vec![rows, cols], data).unwrap_or_else(|| Tensor::zeros(&[rows, cols]))
        };

        let mut params = ParamStore::new();
        params.insert(Self::BACKBONE, random(BOX_DIM, dims.img_dim), true);
        params.insert(Self::WEIGHT, random(BOX_DIM, dims.qvec_dim), true);
        params.insert(Self::BIAS, Tensor::zeros(&[BOX_DIM]), true);

        Self {
            params,
            dims,
            training: true,
            last_img: None,
            last_qvec: None,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn weight(&self, name: &str) -> Result<&Tensor, ModelError> {
        self.params
            .get(name)
            .map(|p| &p.value)
            .ok_or_else(|| ModelError::Other(format!("missing parameter {name}")))
    }
}

/// `out[b, k] += Σ_j x[b, j] · w[k, j]`
fn accumulate(out: &mut [f32], x: &[f32], w: &[f32], in_dim: usize) {
    for (row_out, row_x) in out.chunks_mut(BOX_DIM).zip(x.chunks(in_dim)) {
        for (k, o) in row_out.iter_mut().enumerate() {
            *o += w[k * in_dim..(k + 1) * in_dim]
                .iter()
                .zip(row_x)
                .map(|(w, x)| w * x)
                .sum::<f32>();
        }
    }
}

/// `grad_w[k, j] += Σ_b g[b, k] · x[b, j]`
fn accumulate_grad(grad_w: &mut [f32], g: &[f32], x: &[f32], in_dim: usize) {
    for (row_g, row_x) in g.chunks(BOX_DIM).zip(x.chunks(in_dim)) {
        for (k, gk) in row_g.iter().enumerate() {
            grad_w[k * in_dim..(k + 1) * in_dim]
                .iter_mut()
                .zip(row_x)
                .for_each(|(gw, x)| *gw += gk * x);
        }
    }
}

impl Model for LinearGrounder {
    type Output = Tensor;

    fn forward(&mut self, input: ModelInput<'_>) -> Result<Tensor, ModelError> {
        let qvec = match input.language {
            LanguageInput::QueryVector(q) => q.clone(),
            LanguageInput::Sentences(sents) => {
                let data = sents
                    .iter()
                    .flat_map(|s| embed_sentence(s, self.dims.qvec_dim))
                    .collect();
                Tensor::new(vec![sents.len(), self.dims.qvec_dim], data)
                    .ok_or_else(|| ModelError::Other("bad sentence embedding".into()))?
            }
        };

        let batch = qvec.shape().first().copied().unwrap_or(0);
        if qvec.shape() != [batch, self.dims.qvec_dim] {
            return Err(ModelError::Shape {
                name: "qvec".into(),
                expected: vec![batch, self.dims.qvec_dim],
                got: qvec.shape().to_vec(),
            });
        }

        let mut out = Tensor::zeros(&[batch, BOX_DIM]);
        let bias = self.weight(Self::BIAS)?.data();
        for row in out.data_mut().chunks_mut(BOX_DIM) {
            row.copy_from_slice(bias);
        }
        accumulate(out.data_mut(), qvec.data(), self.weight(Self::WEIGHT)?.data(), self.dims.qvec_dim);

        let img = match input.image {
            Some(img) => {
                if img.shape() != [batch, self.dims.img_dim] {
                    return Err(ModelError::Shape {
                        name: "img".into(),
                        expected: vec![batch, self.dims.img_dim],
                        got: img.shape().to_vec(),
                    });
                }
                accumulate(out.data_mut(), img.data(), self.weight(Self::BACKBONE)?.data(), self.dims.img_dim);
                Some(img.clone())
            }
            None => None,
        };

        if self.training {
            self.last_img = img;
            self.last_qvec = Some(qvec);
        }
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<(), ModelError> {
        let qvec = self
            .last_qvec
            .take()
            .ok_or_else(|| ModelError::Other("backward without a training forward".into()))?;
        let img = self.last_img.take();
        let g = grad_output.data();
        let (img_dim, qvec_dim) = (self.dims.img_dim, self.dims.qvec_dim);

        let missing = |name: &str| ModelError::Other(format!("missing parameter {name}"));

        let weight = self.params.get_mut(Self::WEIGHT).ok_or_else(|| missing(Self::WEIGHT))?;
        accumulate_grad(weight.grad.data_mut(), g, qvec.data(), qvec_dim);

        let bias = self.params.get_mut(Self::BIAS).ok_or_else(|| missing(Self::BIAS))?;
        for row in g.chunks(BOX_DIM) {
            bias.grad
                .data_mut()
                .iter_mut()
                .zip(row)
                .for_each(|(b, g)| *b += g);
        }

        if let Some(img) = img {
            let backbone = self
                .params
                .get_mut(Self::BACKBONE)
                .ok_or_else(|| missing(Self::BACKBONE))?;
            accumulate_grad(backbone.grad.data_mut(), g, img.data(), img_dim);
        }

        Ok(())
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Mean L1 box error, optimized, and mean squared box error, reported only.
#[derive(Debug, Clone)]
pub struct BoxCriterion {
    weights: WeightDict,
}

impl BoxCriterion {
    pub const L1: &'static str = "loss_bbox";
    pub const L2: &'static str = "loss_l2";

    pub fn new(bbox_weight: f64) -> Self {
        Self {
            weights: WeightDict::from([(Self::L1.to_string(), bbox_weight)]),
        }
    }

    fn diffs<'a>(output: &'a Tensor, batch: &'a Batch) -> Result<impl Iterator<Item = f64> + 'a, ModelError> {
        let target = batch.tensor("boxes")?;
        if target.shape() != output.shape() {
            return Err(ModelError::Shape {
                name: "boxes".into(),
                expected: output.shape().to_vec(),
                got: target.shape().to_vec(),
            });
        }

        Ok(output
            .data()
            .iter()
            .zip(target.data())
            .map(|(p, t)| (*p - *t) as f64))
    }
}

impl Criterion<Tensor> for BoxCriterion {
    fn loss_names(&self) -> Vec<String> {
        vec![Self::L1.to_string(), Self::L2.to_string()]
    }

    fn weight_dict(&self) -> &WeightDict {
        &self.weights
    }

    fn compute(&self, output: &Tensor, batch: &Batch) -> Result<ScalarMap, ModelError> {
        let n = output.numel().max(1) as f64;
        let (l1, l2) = Self::diffs(output, batch)?.fold((0., 0.), |(l1, l2), d| (l1 + d.abs(), l2 + d * d));

        Ok(ScalarMap::from([
            (Self::L1.to_string(), l1 / n),
            (Self::L2.to_string(), l2 / n),
        ]))
    }

    fn backward(&self, output: &Tensor, batch: &Batch) -> Result<Tensor, ModelError> {
        let n = output.numel().max(1) as f64;
        let w = self.weights.get(Self::L1).copied().unwrap_or(0.);
        let data = Self::diffs(output, batch)?
            .map(|d| (w * sign(d) / n) as f32)
            .collect();

        Tensor::new(output.shape().to_vec(), data)
            .ok_or_else(|| ModelError::Other("gradient shape mismatch".into()))
    }
}

fn sign(d: f64) -> f64 {
    if d > 0. {
        1.
    } else if d < 0. {
        -1.
    } else {
        0.
    }
}

/// Appends one JSON line per sample to `predictions.jsonl`.
#[derive(Debug, Clone, Default)]
pub struct JsonlVisualizer;

impl Visualizer<Tensor> for JsonlVisualizer {
    fn render(&mut self, output: &Tensor, batch: &Batch, dir: &Path) -> Result<(), ModelError> {
        fs::create_dir_all(dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("predictions.jsonl"))?;

        let sents = batch.text("sents").unwrap_or_default();
        let targets = batch.tensor("boxes")?;
        for (i, (pred, target)) in output
            .data()
            .chunks(BOX_DIM)
            .zip(targets.data().chunks(BOX_DIM))
            .enumerate()
        {
            let line = serde_json::json!({
                "sentence": sents.get(i),
                "pred": pred,
                "target": target,
            });
            writeln!(file, "{line}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::model::{InputSpec, LanguageField};

    fn ctx(rank: usize, world: usize) -> CoordContext {
        CoordContext::new(rank, NonZeroUsize::new(world).unwrap()).unwrap()
    }

    #[test]
    fn shards_are_disjoint_and_cover_the_set() {
        let samples = generate(10, TaskDims::default(), 1);
        let mut seen = Vec::new();

        for rank in 0..3 {
            let mut loader = ShardedLoader::new(samples.clone(), 2, 8, &ctx(rank, 3), 7, true);
            loader.set_epoch(4);
            for batch in loader.batches() {
                let Some(Field::Ids(ids)) = batch.unwrap().get("ids").cloned() else {
                    panic!("batch without ids");
                };
                seen.extend(ids);
            }
        }

        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn epochs_reshuffle_deterministically() {
        let samples = generate(16, TaskDims::default(), 1);
        let mut a = ShardedLoader::new(samples.clone(), 4, 8, &ctx(0, 1), 7, true);
        let mut b = ShardedLoader::new(samples, 4, 8, &ctx(0, 1), 7, true);

        a.set_epoch(1);
        b.set_epoch(1);
        assert_eq!(a.order, b.order);

        b.set_epoch(2);
        assert_ne!(a.order, b.order);
    }

    #[test]
    fn criterion_reports_l2_without_optimizing_it() {
        let output = Tensor::new(vec![1, 4], vec![1., 0., 0., 0.]).unwrap();
        let batch = Batch::new().with("boxes", Field::Tensor(Tensor::zeros(&[1, 4])));
        let criterion = BoxCriterion::new(2.);

        let terms = criterion.compute(&output, &batch).unwrap();
        assert_eq!(terms[BoxCriterion::L1], 0.25);
        assert_eq!(terms[BoxCriterion::L2], 0.25);

        let grad = criterion.backward(&output, &batch).unwrap();
        assert_eq!(grad.data(), [0.5, 0., 0., 0.]);
    }

    #[test]
    fn gradient_steps_reduce_the_loss() {
        let dims = TaskDims::default();
        let samples = generate(32, dims, 3);
        let loader = ShardedLoader::new(samples, 32, dims.qvec_dim, &ctx(0, 1), 0, false);
        let spec = InputSpec {
            language: LanguageField::Sentences,
            use_image: true,
        };
        let criterion = BoxCriterion::new(1.);
        let mut model = LinearGrounder::new(dims, 9);

        let batch = loader.batches().next().unwrap().unwrap();
        let loss = |model: &mut LinearGrounder| {
            let out = model.forward(spec.select(&batch).unwrap()).unwrap();
            (criterion.compute(&out, &batch).unwrap()[BoxCriterion::L1], out)
        };

        let (before, out) = loss(&mut model);
        model.params_mut().zero_grad();
        model.backward(&criterion.backward(&out, &batch).unwrap()).unwrap();
        for (_, p) in model.params_mut().iter_mut() {
            let grad = p.grad.data().to_vec();
            p.value
                .data_mut()
                .iter_mut()
                .zip(grad)
                .for_each(|(v, g)| *v -= 0.01 * g);
        }
        let (after, _) = loss(&mut model);

        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn visualizer_appends_one_line_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let batch = Batch::new()
            .with("boxes", Field::Tensor(Tensor::zeros(&[2, 4])))
            .with("sents", Field::Text(vec!["red dog".into(), "tall man".into()]));
        let output = Tensor::zeros(&[2, 4]);

        let mut vis = JsonlVisualizer;
        vis.render(&output, &batch, dir.path()).unwrap();
        vis.render(&output, &batch, dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join("predictions.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.starts_with(r#"{"pred":[0.0,0.0,0.0,0.0],"sentence":"red dog""#));
    }
}
