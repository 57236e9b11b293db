mod descriptor;
mod kind;
mod types;

pub use descriptor::{DESCRIPTOR_FILE, ModelDescriptor, ModelStatus};
pub use kind::ModelKind;
pub use types::{ClassScore, Detection, ModelMetadata, PredictionResult, SegmentationMap};
