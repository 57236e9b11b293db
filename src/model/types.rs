use ndarray::{Array2, Array3};
use serde::Serialize;

use crate::model::{ModelKind, ModelStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScore {
    pub category_id: usize,
    pub category: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub category_id: usize,
    pub category: String,
    /// `[x, y, width, height]` in original image pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    /// Binary mask over the full original image, instance-segmentation
    /// models only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Array2<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationMap {
    /// Per-pixel class index, `[height, width]`.
    pub label_map: Array2<u32>,
    /// Per-pixel class scores, `[height, width, classes]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_map: Option<Array3<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum PredictionResult {
    Classification(Vec<ClassScore>),
    Detection(Vec<Detection>),
    Segmentation(SegmentationMap),
}

impl PredictionResult {
    pub fn as_classification(&self) -> Option<&[ClassScore]> {
        match self {
            PredictionResult::Classification(scores) => Some(scores),
            _ => None,
        }
    }

    pub fn as_detections(&self) -> Option<&[Detection]> {
        match self {
            PredictionResult::Detection(detections) => Some(detections),
            _ => None,
        }
    }

    pub fn as_segmentation(&self) -> Option<&SegmentationMap> {
        match self {
            PredictionResult::Segmentation(map) => Some(map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub model_type: String,
    pub kind: ModelKind,
    pub status: ModelStatus,
    pub quantized: bool,
    pub num_classes: usize,
    pub labels: Vec<String>,
    pub model_size_bytes: Option<u64>,
    pub params_size_bytes: Option<u64>,
}
