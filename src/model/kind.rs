use serde::Serialize;

use crate::error::PredictorError;

/// Pre/post-processing family, resolved once from `(model_type, model_name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Classifier,
    YoloDetector,
    RegionProposalDetector,
    InstanceSegmentationDetector,
    Segmenter,
}

impl ModelKind {
    pub fn resolve(model_type: &str, model_name: &str) -> Result<Self, PredictorError> {
        match (model_type, model_name) {
            ("classifier", _) => Ok(ModelKind::Classifier),
            ("detector", "YOLOv3") => Ok(ModelKind::YoloDetector),
            ("detector", "FasterRCNN") => Ok(ModelKind::RegionProposalDetector),
            ("detector", "MaskRCNN") => Ok(ModelKind::InstanceSegmentationDetector),
            ("segmenter", _) => Ok(ModelKind::Segmenter),
            _ => Err(PredictorError::unsupported(model_type, model_name)),
        }
    }

    /// Input slots the exported graph is expected to declare.
    pub fn input_names(self) -> &'static [&'static str] {
        match self {
            ModelKind::Classifier | ModelKind::Segmenter => &["image"],
            ModelKind::YoloDetector => &["image", "im_size"],
            ModelKind::RegionProposalDetector | ModelKind::InstanceSegmentationDetector => {
                &["image", "im_info", "im_shape"]
            }
        }
    }

    /// Output slots in the order the exported graph returns them. Slots past
    /// [`required_outputs`](Self::required_outputs) may be absent.
    pub fn output_names(self) -> &'static [&'static str] {
        match self {
            ModelKind::Classifier => &["scores"],
            ModelKind::YoloDetector | ModelKind::RegionProposalDetector => &["bbox", "bbox_num"],
            ModelKind::InstanceSegmentationDetector => &["bbox", "mask", "bbox_num"],
            ModelKind::Segmenter => &["label_map", "score_map"],
        }
    }

    pub fn required_outputs(self) -> usize {
        match self {
            ModelKind::InstanceSegmentationDetector => 2,
            _ => 1,
        }
    }

    pub fn is_optional_output(self, name: &str) -> bool {
        self.output_names()[self.required_outputs()..]
            .iter()
            .any(|slot| *slot == name)
    }
}
