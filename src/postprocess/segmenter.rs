use image::imageops::FilterType;
use ndarray::{Array2, Array3, ArrayD, ArrayView2, Axis, Ix3, Ix4, s};

use crate::{
    engine::InferenceOutput,
    error::PredictorError,
    input,
    model::{PredictionResult, SegmentationMap},
    preprocess::{ImageShape, ShapeInfo},
    transforms::ShapeRecord,
};

pub(super) fn postprocess(
    outputs: &InferenceOutput,
    batch_size: usize,
    shape_info: &ShapeInfo,
) -> Result<Vec<PredictionResult>, PredictorError> {
    if shape_info.len() != batch_size {
        return Err(PredictorError::BadInput(format!(
            "shape info covers {} images, batch has {batch_size}",
            shape_info.len()
        )));
    }
    let labels = outputs
        .named_or_at("label_map", 0)
        .ok_or_else(|| PredictorError::InvalidOutput("missing label map output".into()))?
        .to_f32();
    let labels = label_planes(labels, batch_size)?;

    let scores = match outputs.named_or_at("score_map", 1) {
        Some(tensor) if tensor.shape().len() == 4 => {
            let scores = tensor
                .to_f32()
                .into_dimensionality::<Ix4>()
                .map_err(|e| PredictorError::InvalidOutput(e.to_string()))?;
            if scores.dim().0 != batch_size {
                return Err(PredictorError::InvalidOutput(format!(
                    "score map has {} images, batch has {batch_size}",
                    scores.dim().0
                )));
            }
            Some(scores)
        }
        _ => None,
    };

    let mut results = Vec::with_capacity(batch_size);
    for (idx, image) in shape_info.images.iter().enumerate() {
        let label_plane = restore_plane(labels.index_axis(Axis(0), idx), image, FilterType::Nearest);
        let label_map = label_plane.mapv(|v| v.round().max(0.0) as u32);

        let score_map = scores.as_ref().map(|scores| {
            let per_image = scores.index_axis(Axis(0), idx);
            let planes: Vec<Array2<f32>> = per_image
                .axis_iter(Axis(0))
                .map(|plane| restore_plane(plane, image, FilterType::Triangle))
                .collect();
            stack_hwc(&planes, label_map.dim())
        });

        results.push(PredictionResult::Segmentation(SegmentationMap {
            label_map,
            score_map,
        }));
    }
    Ok(results)
}

/// Accepts `[N, 1, H, W]` or `[N, H, W]` label maps.
fn label_planes(labels: ArrayD<f32>, batch_size: usize) -> Result<Array3<f32>, PredictorError> {
    let shape = labels.shape().to_vec();
    let labels = match shape.as_slice() {
        [n, 1, h, w] => labels
            .into_shape_with_order((*n, *h, *w))
            .map_err(|e| PredictorError::InvalidOutput(e.to_string()))?,
        [_, _, _] => labels
            .into_dimensionality::<Ix3>()
            .map_err(|e| PredictorError::InvalidOutput(e.to_string()))?,
        _ => {
            return Err(PredictorError::InvalidOutput(format!(
                "label map has shape {shape:?}, expected [N, 1, H, W] or [N, H, W]"
            )));
        }
    };
    if labels.dim().0 != batch_size {
        return Err(PredictorError::InvalidOutput(format!(
            "label map has {} images, batch has {batch_size}",
            labels.dim().0
        )));
    }
    Ok(labels)
}

/// Undoes batch padding and then every recorded op in reverse, landing on
/// the original image size.
fn restore_plane(plane: ArrayView2<'_, f32>, image: &ImageShape, filter: FilterType) -> Array2<f32> {
    let (h, w) = image.transformed;
    let mut current = crop(plane, h, w);
    for record in image.records.iter().rev() {
        current = match *record {
            ShapeRecord::Padding { before: (h, w) } => crop(current.view(), h, w),
            ShapeRecord::Resize { before: (h, w) } => input::resize_plane(current.view(), h, w, filter),
        };
    }
    current
}

fn crop(plane: ArrayView2<'_, f32>, h: usize, w: usize) -> Array2<f32> {
    let (ph, pw) = plane.dim();
    plane.slice(s![..h.min(ph), ..w.min(pw)]).to_owned()
}

fn stack_hwc(planes: &[Array2<f32>], (h, w): (usize, usize)) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros((h, w, planes.len()));
    for (c, plane) in planes.iter().enumerate() {
        let (ph, pw) = plane.dim();
        out.slice_mut(s![..ph.min(h), ..pw.min(w), c])
            .assign(&plane.slice(s![..ph.min(h), ..pw.min(w)]));
    }
    out
}
