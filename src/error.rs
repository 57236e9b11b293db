use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("model directory {} does not exist", .0.display())]
    ModelDirNotFound(PathBuf),
    #[error("there is no {file} in {}", .dir.display())]
    DescriptorNotFound { dir: PathBuf, file: String },
    #[error("unsupported model status {0:?}: only quantized or exported inference models are supported")]
    UnsupportedStatus(String),
    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid transform: {0}")]
    InvalidTransform(String),
    #[error("model artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("unsupported model: type {model_type:?}, name {model_name:?}")]
    UnsupportedModel {
        model_type: String,
        model_name: String,
    },
    #[error("engine execution failed: {0}")]
    EngineExecution(String),
    #[error("invalid engine output: {0}")]
    InvalidOutput(String),
    #[error("invalid input: {0}")]
    BadInput(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category, for callers that branch on the failure class
/// rather than the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    UnsupportedModel,
    EngineExecution,
    Input,
    Output,
    Io,
}

impl PredictorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PredictorError::ModelDirNotFound(_)
            | PredictorError::DescriptorNotFound { .. }
            | PredictorError::UnsupportedStatus(_)
            | PredictorError::InvalidDescriptor(_)
            | PredictorError::InvalidTransform(_)
            | PredictorError::MissingArtifact(_) => ErrorKind::Configuration,
            PredictorError::UnsupportedModel { .. } => ErrorKind::UnsupportedModel,
            PredictorError::EngineExecution(_) => ErrorKind::EngineExecution,
            PredictorError::BadInput(_) | PredictorError::Image(_) => ErrorKind::Input,
            PredictorError::InvalidOutput(_) => ErrorKind::Output,
            PredictorError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    pub(crate) fn unsupported(model_type: &str, model_name: &str) -> Self {
        PredictorError::UnsupportedModel {
            model_type: model_type.to_string(),
            model_name: model_name.to_string(),
        }
    }
}

pub type Result<T, E = PredictorError> = std::result::Result<T, E>;
