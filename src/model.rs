//! The collaborators consumed by the training core: model, criterion, data and
//! visualization, plus the tensors and batches flowing between them.

use std::{
    collections::BTreeMap,
    error::Error,
    fmt, io,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{dist::ScalarMap, params::ParamStore};

/// Batch fields that hold raw text and are never moved to the device.
pub const RESERVED_FIELDS: [&str; 2] = ["sents", "masked_words"];

#[derive(Debug)]
pub enum ModelError {
    MissingField(String),
    WrongField {
        name: String,
        expected: &'static str,
    },
    Shape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    Io(io::Error),
    Other(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "batch has no field {name:?}"),
            Self::WrongField { name, expected } => {
                write!(f, "batch field {name:?} is not {expected}")
            }
            Self::Shape {
                name,
                expected,
                got,
            } => write!(f, "{name}: expected shape {expected:?}, got {got:?}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Other(detail) => f.write_str(detail),
        }
    }
}

impl Error for ModelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ModelError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// A dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor out of its shape and flat data.
    ///
    /// # Returns
    /// `None` if `data` doesn't hold exactly as many elements as `shape` describes.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then_some(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// The sum of the squares of every element.
    pub fn sq_norm(&self) -> f64 {
        self.data.iter().map(|x| (*x as f64).powi(2)).sum()
    }
}

/// One named value of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Tensor(Tensor),
    Text(Vec<String>),
    Ids(Vec<u64>),
}

/// A mapping from field name to value, as produced by a `DataLoader`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    fields: BTreeMap<String, Field>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        self.fields.insert(name.into(), field);
    }

    pub fn with(mut self, name: impl Into<String>, field: Field) -> Self {
        self.insert(name, field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor, ModelError> {
        match self.get(name) {
            Some(Field::Tensor(t)) => Ok(t),
            Some(_) => Err(ModelError::WrongField {
                name: name.to_string(),
                expected: "a tensor",
            }),
            None => Err(ModelError::MissingField(name.to_string())),
        }
    }

    pub fn text(&self, name: &str) -> Result<&[String], ModelError> {
        match self.get(name) {
            Some(Field::Text(t)) => Ok(t),
            Some(_) => Err(ModelError::WrongField {
                name: name.to_string(),
                expected: "text",
            }),
            None => Err(ModelError::MissingField(name.to_string())),
        }
    }

    /// Moves every tensor field, except the reserved text fields, with `placer`.
    pub fn place_with<F: FnMut(&mut Tensor)>(&mut self, mut placer: F) {
        self.fields
            .iter_mut()
            .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
            .for_each(|(_, field)| {
                if let Field::Tensor(t) = field {
                    placer(t);
                }
            });
    }
}

/// Which batch field feeds the language branch of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LanguageField {
    /// Precomputed query embeddings.
    #[default]
    #[serde(rename = "qvec")]
    QueryVector,
    /// Raw sentences.
    #[serde(rename = "sents")]
    Sentences,
}

impl LanguageField {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::QueryVector => "qvec",
            Self::Sentences => "sents",
        }
    }
}

/// The model input selection, resolved once from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub language: LanguageField,
    pub use_image: bool,
}

/// The language part of a model input.
#[derive(Debug, Clone, Copy)]
pub enum LanguageInput<'a> {
    QueryVector(&'a Tensor),
    Sentences(&'a [String]),
}

/// What the model is called with for one batch.
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    pub image: Option<&'a Tensor>,
    pub language: LanguageInput<'a>,
}

impl InputSpec {
    /// Picks the model input out of `batch`.
    ///
    /// # Errors
    /// Returns a `ModelError` if a selected field is missing or of the wrong kind.
    pub fn select<'a>(&self, batch: &'a Batch) -> Result<ModelInput<'a>, ModelError> {
        let image = if self.use_image {
            Some(batch.tensor("img")?)
        } else {
            None
        };

        let language = match self.language {
            LanguageField::QueryVector => LanguageInput::QueryVector(batch.tensor("qvec")?),
            LanguageField::Sentences => LanguageInput::Sentences(batch.text("sents")?),
        };

        Ok(ModelInput { image, language })
    }
}

/// The grounding model being trained.
pub trait Model {
    type Output;

    fn forward(&mut self, input: ModelInput<'_>) -> Result<Self::Output, ModelError>;

    /// Accumulates into the parameter gradients the gradient of a scalar with
    /// respect to the output of the last `forward` call.
    fn backward(&mut self, grad_output: &Self::Output) -> Result<(), ModelError>;

    fn params(&self) -> &ParamStore;

    fn params_mut(&mut self) -> &mut ParamStore;

    fn set_training(&mut self, training: bool);

    /// Moves a batch tensor to the device the model lives on.
    fn place(&self, _tensor: &mut Tensor) {}
}

/// Loss weights by term name.
pub type WeightDict = BTreeMap<String, f64>;

/// Matches predictions to targets and computes the named loss terms.
pub trait Criterion<O> {
    /// Every term name `compute` may produce.
    fn loss_names(&self) -> Vec<String>;

    /// The weights of the terms that are optimized. Terms absent from this
    /// map are reported only.
    fn weight_dict(&self) -> &WeightDict;

    fn compute(&self, output: &O, batch: &Batch) -> Result<ScalarMap, ModelError>;

    /// The gradient of the weighted sum of terms with respect to `output`.
    fn backward(&self, output: &O, batch: &Batch) -> Result<O, ModelError>;
}

/// A source of batches, sharded for this worker.
pub trait DataLoader {
    /// Reshuffles for `epoch`, every worker must see a disjoint shard.
    fn set_epoch(&mut self, epoch: usize);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&self) -> impl Iterator<Item = Result<Batch, ModelError>> + '_;
}

/// Renders predictions next to their batch.
pub trait Visualizer<O> {
    fn render(&mut self, output: &O, batch: &Batch, dir: &Path) -> Result<(), ModelError>;
}
