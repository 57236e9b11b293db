pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod model;
pub mod postprocess;
pub mod predictor;
pub mod preprocess;
pub mod transforms;

pub use config::{DeviceSpec, EngineConfig, PredictorOptions};
pub use engine::{InferenceEngine, InferenceOutput, Tensor};
pub use error::{ErrorKind, PredictorError};
pub use input::ImageInput;
pub use model::{
    ClassScore, Detection, ModelDescriptor, ModelKind, ModelMetadata, ModelStatus, PredictionResult,
    SegmentationMap,
};
pub use predictor::Predictor;
pub use preprocess::{DEFAULT_CONCURRENCY, PreprocessedBatch, ShapeInfo};
