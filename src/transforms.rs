use image::imageops::FilterType;
use ndarray::{Array3, s};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::{error::PredictorError, input, model::ModelKind};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const SEG_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const SEG_STD: [f32; 3] = [0.5, 0.5, 0.5];
const SEG_PADDING_VALUE: [f32; 3] = [127.5, 127.5, 127.5];

/// One entry of the descriptor's `Transforms` list, unparsed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub name: String,
    pub params: Mapping,
}

impl TransformSpec {
    pub fn new(name: impl Into<String>, params: Mapping) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn from_yaml(value: &Value) -> Result<Self, PredictorError> {
        match value {
            Value::String(name) => Ok(Self::new(name.clone(), Mapping::new())),
            Value::Mapping(map) if map.len() == 1 => {
                let (key, params) = map
                    .iter()
                    .next()
                    .ok_or_else(|| PredictorError::InvalidTransform("empty transform entry".into()))?;
                let name = key.as_str().ok_or_else(|| {
                    PredictorError::InvalidTransform(format!("transform name {key:?} is not a string"))
                })?;
                let params = match params {
                    Value::Mapping(params) => params.clone(),
                    Value::Null => Mapping::new(),
                    other => {
                        return Err(PredictorError::InvalidTransform(format!(
                            "parameters of {name} must be a mapping, got {other:?}"
                        )));
                    }
                };
                Ok(Self::new(name, params))
            }
            other => Err(PredictorError::InvalidTransform(format!(
                "expected a single-key mapping, got {other:?}"
            ))),
        }
    }
}

/// Spatial op recorded during preprocessing, with the `(height, width)`
/// the image had right before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRecord {
    Resize { before: (usize, usize) },
    Padding { before: (usize, usize) },
}

/// An image in flight through the pipeline.
#[derive(Debug, Clone)]
pub struct ImageSample {
    /// `H x W x C` pixels.
    pub data: Array3<f32>,
    /// `(height, width)` as decoded.
    pub original: (usize, usize),
    /// `(height, width)` after the last resize, before any padding.
    pub resized: (usize, usize),
    /// Scale applied by the last resize (`resized / original`).
    pub scale: f32,
    pub records: Vec<ShapeRecord>,
}

impl ImageSample {
    pub fn new(data: Array3<f32>) -> Self {
        let (h, w, _) = data.dim();
        Self {
            data,
            original: (h, w),
            resized: (h, w),
            scale: 1.0,
            records: Vec::new(),
        }
    }

    pub fn size(&self) -> (usize, usize) {
        let (h, w, _) = self.data.dim();
        (h, w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Nearest,
    Linear,
    Cubic,
    Area,
    Lanczos,
}

impl Interp {
    fn parse(raw: &str) -> Result<Self, PredictorError> {
        match raw {
            "NEAREST" => Ok(Interp::Nearest),
            // RANDOM only matters for training-time augmentation.
            "LINEAR" | "RANDOM" => Ok(Interp::Linear),
            "CUBIC" => Ok(Interp::Cubic),
            "AREA" => Ok(Interp::Area),
            "LANCZOS4" => Ok(Interp::Lanczos),
            other => Err(PredictorError::InvalidTransform(format!(
                "unknown interpolation {other:?}"
            ))),
        }
    }

    fn filter(self) -> FilterType {
        match self {
            Interp::Nearest => FilterType::Nearest,
            Interp::Linear | Interp::Area => FilterType::Triangle,
            Interp::Cubic => FilterType::CatmullRom,
            Interp::Lanczos => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    ResizeByShort {
        short_size: usize,
        max_size: Option<usize>,
    },
    ResizeByLong {
        long_size: usize,
    },
    /// Resize to a fixed `(width, height)`.
    Resize {
        target: (usize, usize),
        interp: Interp,
    },
    /// Center crop to `(width, height)`.
    CenterCrop {
        crop: (usize, usize),
    },
    Padding {
        coarsest_stride: usize,
        /// Fixed `(width, height)` to pad up to.
        target: Option<(usize, usize)>,
        value: [f32; 3],
    },
    Normalize {
        mean: [f32; 3],
        std: [f32; 3],
        min_val: [f32; 3],
        max_val: [f32; 3],
    },
}

impl Transform {
    pub fn from_spec(spec: &TransformSpec, kind: ModelKind) -> Result<Option<Self>, PredictorError> {
        let params = &spec.params;
        let name = spec.name.as_str();
        let transform = match name {
            "ResizeByShort" => Transform::ResizeByShort {
                short_size: get_usize(params, name, "short_size")?.unwrap_or(800),
                max_size: get_i64(params, name, "max_size")?
                    .filter(|&v| v > 0)
                    .map(|v| v as usize),
            },
            "ResizeByLong" => Transform::ResizeByLong {
                long_size: get_usize(params, name, "long_size")?.unwrap_or(256),
            },
            "Resize" => Transform::Resize {
                target: get_size(params, name, "target_size")?.unwrap_or((512, 512)),
                interp: match params.get("interp").and_then(Value::as_str) {
                    Some(raw) => Interp::parse(raw)?,
                    None => Interp::Linear,
                },
            },
            "CenterCrop" => Transform::CenterCrop {
                crop: get_size(params, name, "crop_size")?.unwrap_or((224, 224)),
            },
            "Padding" => {
                let target = get_size(params, name, "target_size")?;
                let default_value = if kind == ModelKind::Segmenter {
                    SEG_PADDING_VALUE
                } else {
                    [0.0; 3]
                };
                Transform::Padding {
                    coarsest_stride: get_usize(params, name, "coarsest_stride")?.unwrap_or(1),
                    target,
                    value: get_triple(params, name, "im_padding_value")?.unwrap_or(default_value),
                }
            }
            "Normalize" => {
                let (mean, std) = if kind == ModelKind::Segmenter {
                    (SEG_MEAN, SEG_STD)
                } else {
                    (IMAGENET_MEAN, IMAGENET_STD)
                };
                let std = get_triple(params, name, "std")?.unwrap_or(std);
                if std.iter().any(|&s| s <= 0.0) {
                    return Err(PredictorError::InvalidTransform(format!(
                        "Normalize std must be positive, got {std:?}"
                    )));
                }
                let min_val = get_triple(params, name, "min_val")?.unwrap_or([0.0; 3]);
                let max_val = get_triple(params, name, "max_val")?.unwrap_or([255.0; 3]);
                if min_val.iter().zip(&max_val).any(|(lo, hi)| hi <= lo) {
                    return Err(PredictorError::InvalidTransform(
                        "Normalize max_val must exceed min_val".into(),
                    ));
                }
                Transform::Normalize {
                    mean: get_triple(params, name, "mean")?.unwrap_or(mean),
                    std,
                    min_val,
                    max_val,
                }
            }
            arrange if arrange.starts_with("Arrange") => {
                debug!(transform = arrange, "skipping arrange transform");
                return Ok(None);
            }
            other => {
                return Err(PredictorError::InvalidTransform(format!(
                    "unsupported transform {other:?}"
                )));
            }
        };
        Ok(Some(transform))
    }

    pub fn apply(&self, sample: &mut ImageSample) -> Result<(), PredictorError> {
        match *self {
            Transform::ResizeByShort {
                short_size,
                max_size,
            } => {
                let (h, w) = sample.size();
                let short = h.min(w) as f32;
                let long = h.max(w) as f32;
                let mut scale = short_size as f32 / short;
                if let Some(max_size) = max_size {
                    if (scale * long).round() > max_size as f32 {
                        scale = max_size as f32 / long;
                    }
                }
                let new_h = ((h as f32 * scale).round() as usize).max(1);
                let new_w = ((w as f32 * scale).round() as usize).max(1);
                resize_sample(sample, new_h, new_w, FilterType::Triangle);
                sample.scale = scale;
            }
            Transform::ResizeByLong { long_size } => {
                let (h, w) = sample.size();
                let scale = long_size as f32 / h.max(w) as f32;
                let new_h = ((h as f32 * scale).round() as usize).max(1);
                let new_w = ((w as f32 * scale).round() as usize).max(1);
                resize_sample(sample, new_h, new_w, FilterType::Triangle);
                sample.scale = scale;
            }
            Transform::Resize {
                target: (width, height),
                interp,
            } => {
                let (h, _) = sample.size();
                resize_sample(sample, height, width, interp.filter());
                sample.scale = height as f32 / h as f32;
            }
            Transform::CenterCrop {
                crop: (width, height),
            } => {
                let (h, w) = sample.size();
                let crop_h = height.min(h);
                let crop_w = width.min(w);
                let top = (h - crop_h) / 2;
                let left = (w - crop_w) / 2;
                sample.data = sample
                    .data
                    .slice(s![top..top + crop_h, left..left + crop_w, ..])
                    .to_owned();
            }
            Transform::Padding {
                coarsest_stride,
                target,
                value,
            } => {
                let (h, w) = sample.size();
                let (pad_h, pad_w) = match target {
                    Some((tw, th)) => {
                        if th < h || tw < w {
                            return Err(PredictorError::BadInput(format!(
                                "image {h}x{w} is larger than padding target {th}x{tw}"
                            )));
                        }
                        (th, tw)
                    }
                    None if coarsest_stride > 1 => (
                        h.div_ceil(coarsest_stride) * coarsest_stride,
                        w.div_ceil(coarsest_stride) * coarsest_stride,
                    ),
                    None => (h, w),
                };
                if (pad_h, pad_w) != (h, w) {
                    sample.records.push(ShapeRecord::Padding { before: (h, w) });
                    let channels = sample.data.dim().2;
                    let mut padded = Array3::<f32>::zeros((pad_h, pad_w, channels));
                    for c in 0..channels {
                        padded
                            .slice_mut(s![.., .., c])
                            .fill(value.get(c).copied().unwrap_or(0.0));
                    }
                    padded.slice_mut(s![..h, ..w, ..]).assign(&sample.data);
                    sample.data = padded;
                }
            }
            Transform::Normalize {
                mean,
                std,
                min_val,
                max_val,
            } => {
                for (c, mut channel) in sample.data.axis_iter_mut(ndarray::Axis(2)).enumerate() {
                    let idx = c.min(2);
                    let range = max_val[idx] - min_val[idx];
                    channel.mapv_inplace(|v| ((v - min_val[idx]) / range - mean[idx]) / std[idx]);
                }
            }
        }
        Ok(())
    }
}

fn resize_sample(sample: &mut ImageSample, height: usize, width: usize, filter: FilterType) {
    let before = sample.size();
    sample.records.push(ShapeRecord::Resize { before });
    sample.data = input::resize(&sample.data, height, width, filter);
    sample.resized = (height, width);
}

/// The ordered inference transforms of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTransforms {
    transforms: Vec<Transform>,
    to_rgb: bool,
}

impl ComposedTransforms {
    pub fn build(kind: ModelKind, specs: &[TransformSpec], to_rgb: bool) -> Result<Self, PredictorError> {
        let transforms = specs
            .iter()
            .map(|spec| Transform::from_spec(spec, kind))
            .filter_map(Result::transpose)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = transforms.len(), to_rgb, "built transform pipeline");
        Ok(Self { transforms, to_rgb })
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn to_rgb(&self) -> bool {
        self.to_rgb
    }

    /// Runs the pipeline over a BGR image.
    pub fn apply(&self, mut bgr: Array3<f32>) -> Result<ImageSample, PredictorError> {
        if self.to_rgb {
            input::swap_channels(&mut bgr);
        }
        let mut sample = ImageSample::new(bgr);
        for transform in &self.transforms {
            transform.apply(&mut sample)?;
        }
        Ok(sample)
    }
}

fn get_i64(params: &Mapping, transform: &str, key: &str) -> Result<Option<i64>, PredictorError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            PredictorError::InvalidTransform(format!("{transform}.{key} must be an integer"))
        }),
    }
}

fn get_usize(params: &Mapping, transform: &str, key: &str) -> Result<Option<usize>, PredictorError> {
    match get_i64(params, transform, key)? {
        Some(v) if v > 0 => Ok(Some(v as usize)),
        Some(v) => Err(PredictorError::InvalidTransform(format!(
            "{transform}.{key} must be positive, got {v}"
        ))),
        None => Ok(None),
    }
}

/// Size given either as one integer or as `[width, height]`.
fn get_size(
    params: &Mapping,
    transform: &str,
    key: &str,
) -> Result<Option<(usize, usize)>, PredictorError> {
    let invalid = || {
        PredictorError::InvalidTransform(format!(
            "{transform}.{key} must be a positive integer or [width, height]"
        ))
    };
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Sequence(items)) if items.len() == 2 => {
            let w = items[0].as_u64().filter(|&v| v > 0).ok_or_else(invalid)?;
            let h = items[1].as_u64().filter(|&v| v > 0).ok_or_else(invalid)?;
            Ok(Some((w as usize, h as usize)))
        }
        Some(value) => {
            let v = value.as_u64().filter(|&v| v > 0).ok_or_else(invalid)? as usize;
            Ok(Some((v, v)))
        }
    }
}

fn get_triple(params: &Mapping, transform: &str, key: &str) -> Result<Option<[f32; 3]>, PredictorError> {
    let invalid =
        || PredictorError::InvalidTransform(format!("{transform}.{key} must be a list of 3 numbers"));
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Sequence(items)) if items.len() == 3 => {
            let mut out = [0.0f32; 3];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = item.as_f64().ok_or_else(invalid)? as f32;
            }
            Ok(Some(out))
        }
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(yaml: &str) -> Vec<TransformSpec> {
        let values: Vec<Value> = serde_yaml::from_str(yaml).unwrap();
        values.iter().map(|v| TransformSpec::from_yaml(v).unwrap()).collect()
    }

    #[test]
    fn classifier_pipeline_resizes_crops_and_normalizes() {
        let transforms = ComposedTransforms::build(
            ModelKind::Classifier,
            &specs(
                r#"
- ResizeByShort: {short_size: 8, max_size: -1}
- CenterCrop: {crop_size: 4}
- Normalize: {mean: [0.5, 0.5, 0.5], std: [0.5, 0.5, 0.5]}
"#,
            ),
            false,
        )
        .unwrap();

        let sample = transforms
            .apply(Array3::from_elem((16, 32, 3), 255.0))
            .unwrap();
        assert_eq!(sample.resized, (8, 16));
        assert_eq!(sample.size(), (4, 4));
        assert!(sample.data.iter().all(|v| (v - 1.0).abs() < 1e-4));
        assert_eq!(sample.records, vec![ShapeRecord::Resize { before: (16, 32) }]);
    }

    #[test]
    fn resize_by_short_respects_max_size() {
        let mut sample = ImageSample::new(Array3::zeros((100, 400, 3)));
        Transform::ResizeByShort {
            short_size: 50,
            max_size: Some(100),
        }
        .apply(&mut sample)
        .unwrap();
        assert_eq!(sample.size(), (25, 100));
        assert!((sample.scale - 0.25).abs() < 1e-6);
    }

    #[test]
    fn padding_to_stride_records_previous_size() {
        let mut sample = ImageSample::new(Array3::from_elem((5, 7, 3), 1.0));
        Transform::Padding {
            coarsest_stride: 4,
            target: None,
            value: [0.0; 3],
        }
        .apply(&mut sample)
        .unwrap();
        assert_eq!(sample.size(), (8, 8));
        assert_eq!(sample.data[[7, 7, 0]], 0.0);
        assert_eq!(sample.data[[4, 6, 2]], 1.0);
        assert_eq!(sample.records, vec![ShapeRecord::Padding { before: (5, 7) }]);
    }

    #[test]
    fn segmenter_padding_defaults_to_mid_gray() {
        let transform = Transform::from_spec(
            &specs("- Padding: {target_size: 8}")[0],
            ModelKind::Segmenter,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            transform,
            Transform::Padding {
                coarsest_stride: 1,
                target: Some((8, 8)),
                value: [127.5; 3],
            }
        );
    }

    #[test]
    fn to_rgb_swaps_before_transforms() {
        let transforms = ComposedTransforms::build(ModelKind::Classifier, &[], true).unwrap();
        let mut bgr = Array3::zeros((1, 1, 3));
        bgr[[0, 0, 0]] = 1.0;
        let sample = transforms.apply(bgr).unwrap();
        assert_eq!(sample.data[[0, 0, 2]], 1.0);
        assert_eq!(sample.data[[0, 0, 0]], 0.0);
    }

    #[test]
    fn arrange_entries_are_skipped() {
        let transforms = ComposedTransforms::build(
            ModelKind::YoloDetector,
            &specs("- Resize: {target_size: 608, interp: CUBIC}\n- ArrangeYOLOv3: {mode: test}"),
            true,
        )
        .unwrap();
        assert_eq!(
            transforms.transforms(),
            &[Transform::Resize {
                target: (608, 608),
                interp: Interp::Cubic
            }]
        );
    }

    #[test]
    fn unknown_transform_is_rejected() {
        let err = ComposedTransforms::build(
            ModelKind::Classifier,
            &specs("- RandomDistort: {}"),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, PredictorError::InvalidTransform(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let err = ComposedTransforms::build(
            ModelKind::Classifier,
            &specs("- Normalize: {mean: [0.5, 0.5]}"),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Normalize.mean"));
    }
}
