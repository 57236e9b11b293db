mod classifier;
mod detector;
mod segmenter;

pub use classifier::top_k;
pub use detector::paste_mask;

use crate::{
    engine::InferenceOutput,
    error::PredictorError,
    model::{ModelDescriptor, ModelKind, PredictionResult},
    preprocess::ShapeInfo,
};

/// Output decoding for one loaded model.
#[derive(Debug, Clone, Copy)]
pub struct Postprocessor<'a> {
    kind: ModelKind,
    descriptor: &'a ModelDescriptor,
}

impl<'a> Postprocessor<'a> {
    pub fn new(kind: ModelKind, descriptor: &'a ModelDescriptor) -> Self {
        Self { kind, descriptor }
    }

    /// Returns one result per batch item, in batch order.
    pub fn run(
        &self,
        outputs: &InferenceOutput,
        topk: usize,
        batch_size: usize,
        shape_info: Option<&ShapeInfo>,
    ) -> Result<Vec<PredictionResult>, PredictorError> {
        if outputs.is_empty() {
            return Err(PredictorError::InvalidOutput("engine produced no outputs".into()));
        }
        match self.kind {
            ModelKind::Classifier => {
                let k = match self.descriptor.num_classes {
                    0 => topk,
                    num_classes => num_classes.min(topk),
                };
                classifier::postprocess(outputs, k, batch_size, &self.descriptor.labels)
            }
            ModelKind::YoloDetector | ModelKind::RegionProposalDetector => {
                detector::postprocess(self.kind, self.descriptor, outputs, batch_size, None)
            }
            ModelKind::InstanceSegmentationDetector => {
                let resolution = self.descriptor.mask_head_resolution().ok_or_else(|| {
                    PredictorError::unsupported(&self.descriptor.model_type, &self.descriptor.model_name)
                })?;
                let shape_info = shape_info.ok_or_else(|| {
                    PredictorError::BadInput("mask decoding needs the original image shapes".into())
                })?;
                detector::postprocess(
                    self.kind,
                    self.descriptor,
                    outputs,
                    batch_size,
                    Some((resolution, shape_info)),
                )
            }
            ModelKind::Segmenter => {
                let shape_info = shape_info.ok_or_else(|| {
                    PredictorError::BadInput("segmentation needs resize/padding info".into())
                })?;
                segmenter::postprocess(outputs, batch_size, shape_info)
            }
        }
    }
}
