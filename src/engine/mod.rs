mod tensor;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use tensor::Tensor;

use crate::{config::EngineConfig, error::PredictorError};

/// A loaded inference graph with named input and output slots.
///
/// Calls are synchronous. One engine holds one set of bound inputs, so a
/// handle must not be driven from two threads at once.
pub trait InferenceEngine: Send {
    fn input_names(&self) -> &[String];

    fn output_names(&self) -> &[String];

    /// Copies `tensor` into the input slot `name`.
    fn set_input(&mut self, name: &str, tensor: &Tensor) -> Result<(), PredictorError>;

    /// Runs one forward pass over the currently bound inputs.
    fn run(&mut self) -> Result<(), PredictorError>;

    /// Whether the last run produced the output slot `name`.
    fn has_output(&self, name: &str) -> bool;

    /// Copies the output slot `name` of the last run back to the host.
    fn output(&self, name: &str) -> Result<Tensor, PredictorError>;
}

/// Raw engine outputs in declared order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutput {
    entries: Vec<(String, Tensor)>,
}

impl InferenceOutput {
    pub fn new(entries: Vec<(String, Tensor)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn at(&self, index: usize) -> Option<&Tensor> {
        self.entries.get(index).map(|(_, tensor)| tensor)
    }

    /// Looks `name` up, falling back to the positional slot for graphs
    /// exported with generated output names.
    pub fn named_or_at(&self, name: &str, index: usize) -> Option<&Tensor> {
        self.get(name).or_else(|| self.at(index))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }
}

/// Opens the engine compiled into this build.
#[cfg(feature = "tch-backend")]
pub fn create_engine(config: &EngineConfig) -> Result<Box<dyn InferenceEngine>, PredictorError> {
    Ok(Box::new(tch_backend::TorchEngine::load(config)?))
}

#[cfg(not(feature = "tch-backend"))]
pub fn create_engine(config: &EngineConfig) -> Result<Box<dyn InferenceEngine>, PredictorError> {
    Err(PredictorError::EngineExecution(format!(
        "no inference backend compiled in (enable the `tch-backend` feature) to load {}",
        config.model_path.display()
    )))
}
