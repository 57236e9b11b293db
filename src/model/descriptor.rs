use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::{error::PredictorError, transforms::TransformSpec};

pub const DESCRIPTOR_FILE: &str = "model.yml";

const MASK_HEAD_RESOLUTION_FPN: usize = 28;
const MASK_HEAD_RESOLUTION: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Quantized,
    Inference,
}

impl ModelStatus {
    pub fn parse(raw: &str) -> Result<Self, PredictorError> {
        match raw {
            "Quant" | "Quantized" => Ok(ModelStatus::Quantized),
            "Infer" | "Inference" => Ok(ModelStatus::Inference),
            other => Err(PredictorError::UnsupportedStatus(other.to_string())),
        }
    }
}

/// The consumed subset of an exported model's `model.yml`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub status: ModelStatus,
    pub model_type: String,
    pub model_name: String,
    pub num_classes: usize,
    pub labels: Vec<String>,
    pub transforms: Vec<TransformSpec>,
    pub transforms_mode: String,
    pub with_fpn: bool,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    status: String,
    #[serde(rename = "Model")]
    model: String,
    #[serde(rename = "_Attributes")]
    attributes: RawAttributes,
    #[serde(rename = "_init_params", default)]
    init_params: Option<RawInitParams>,
    #[serde(rename = "Transforms", default)]
    transforms: Option<Vec<Value>>,
    #[serde(rename = "TransformsMode", default)]
    transforms_mode: Option<String>,
    #[serde(default)]
    version: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawAttributes {
    model_type: String,
    num_classes: usize,
    #[serde(default)]
    labels: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInitParams {
    #[serde(default)]
    with_fpn: Option<bool>,
}

impl ModelDescriptor {
    pub fn load(model_dir: &Path) -> Result<Self, PredictorError> {
        if !model_dir.is_dir() {
            return Err(PredictorError::ModelDirNotFound(model_dir.to_path_buf()));
        }
        let path = model_dir.join(DESCRIPTOR_FILE);
        if !path.is_file() {
            return Err(PredictorError::DescriptorNotFound {
                dir: model_dir.to_path_buf(),
                file: DESCRIPTOR_FILE.to_string(),
            });
        }
        let raw = fs::read_to_string(&path)?;
        debug!(path = %path.display(), "parsing model descriptor");
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, PredictorError> {
        let raw: RawDescriptor = serde_yaml::from_str(raw)
            .map_err(|e| PredictorError::InvalidDescriptor(e.to_string()))?;

        let status = ModelStatus::parse(&raw.status)?;

        let labels = raw
            .attributes
            .labels
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                scalar_to_string(&value).ok_or_else(|| {
                    PredictorError::InvalidDescriptor(format!("label {idx} is not a scalar"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let transforms = raw
            .transforms
            .unwrap_or_default()
            .iter()
            .map(TransformSpec::from_yaml)
            .collect::<Result<Vec<_>, _>>()?;

        let with_fpn = raw
            .init_params
            .and_then(|params| params.with_fpn)
            .unwrap_or(false);

        Ok(Self {
            status,
            model_type: raw.attributes.model_type,
            model_name: raw.model,
            num_classes: raw.attributes.num_classes,
            labels,
            transforms,
            transforms_mode: raw.transforms_mode.unwrap_or_else(|| "RGB".to_string()),
            with_fpn,
            version: raw.version.as_ref().and_then(scalar_to_string),
        })
    }

    pub fn to_rgb(&self) -> bool {
        self.transforms_mode == "RGB"
    }

    pub fn is_quantized(&self) -> bool {
        self.status == ModelStatus::Quantized
    }

    /// Side length of the mask head output. Only Mask R-CNN has one.
    pub fn mask_head_resolution(&self) -> Option<usize> {
        if self.model_name != "MaskRCNN" {
            return None;
        }
        if self.with_fpn {
            Some(MASK_HEAD_RESOLUTION_FPN)
        } else {
            Some(MASK_HEAD_RESOLUTION)
        }
    }

    pub fn label(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
