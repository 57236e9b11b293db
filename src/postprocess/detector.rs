use std::ops::Range;

use image::imageops::FilterType;
use ndarray::{Array2, Array4, ArrayD, ArrayView2, Ix2, Ix4, s};
use tracing::debug;

use crate::{
    engine::{InferenceOutput, Tensor},
    error::PredictorError,
    input,
    model::{Detection, ModelDescriptor, ModelKind, PredictionResult},
    preprocess::ShapeInfo,
};

/// Columns of a box row: `class, score, x1, y1, x2, y2`.
const BOX_COLUMNS: usize = 6;
const MASK_THRESHOLD: f32 = 0.5;
/// Largest box side, in pixels, a mask is scaled to before pasting.
const MAX_PASTE_SIDE: i64 = 1 << 14;

pub(super) fn postprocess(
    kind: ModelKind,
    descriptor: &ModelDescriptor,
    outputs: &InferenceOutput,
    batch_size: usize,
    masks: Option<(usize, &ShapeInfo)>,
) -> Result<Vec<PredictionResult>, PredictorError> {
    let boxes = outputs
        .named_or_at("bbox", 0)
        .ok_or_else(|| PredictorError::InvalidOutput("missing box output".into()))?
        .to_f32();
    let rows = box_rows(&boxes)?;
    if let Some(idx) = rows
        .rows()
        .into_iter()
        .position(|row| row.iter().any(|v| !v.is_finite()))
    {
        return Err(PredictorError::InvalidOutput(format!(
            "box row {idx} holds non-finite values"
        )));
    }
    let ranges = split_rows(rows.nrows(), outputs.get("bbox_num"), batch_size)?;

    let mask_tensor = match masks {
        Some((resolution, _)) => {
            let mask = outputs
                .named_or_at("mask", 1)
                .ok_or_else(|| PredictorError::InvalidOutput("missing mask output".into()))?
                .to_f32();
            Some(mask_planes(mask, rows.nrows(), resolution)?)
        }
        None => None,
    };

    let class_offset = class_offset(kind, descriptor);
    let mut results = Vec::with_capacity(batch_size);
    for (image_idx, range) in ranges.into_iter().enumerate() {
        let mut detections = Vec::with_capacity(range.len());
        for row_idx in range {
            let row = rows.row(row_idx);
            let class_id = row[0].max(0.0) as usize;
            let (x1, y1, x2, y2) = (row[2], row[3], row[4], row[5]);
            let category = class_id
                .checked_sub(class_offset)
                .and_then(|idx| descriptor.label(idx))
                .map(str::to_string)
                .unwrap_or_else(|| class_id.to_string());

            let mask = match (&mask_tensor, masks) {
                (Some(planes), Some((_, shape_info))) => {
                    let image = shape_info.get(image_idx).ok_or_else(|| {
                        PredictorError::InvalidOutput(format!("no shape info for image {image_idx}"))
                    })?;
                    let channel = class_id.min(planes.dim().1.saturating_sub(1));
                    let plane = planes.slice(s![row_idx, channel, .., ..]);
                    Some(paste_mask(plane, [x1, y1, x2, y2], image.original))
                }
                _ => None,
            };

            detections.push(Detection {
                category_id: class_id,
                category,
                bbox: [x1, y1, x2 - x1 + 1.0, y2 - y1 + 1.0],
                score: row[1],
                mask,
            });
        }
        results.push(PredictionResult::Detection(detections));
    }
    Ok(results)
}

/// Region-proposal graphs reserve class 0 for background when the label
/// list does not include it.
fn class_offset(kind: ModelKind, descriptor: &ModelDescriptor) -> usize {
    let region_proposal = matches!(
        kind,
        ModelKind::RegionProposalDetector | ModelKind::InstanceSegmentationDetector
    );
    if region_proposal && descriptor.labels.len() + 1 == descriptor.num_classes {
        1
    } else {
        0
    }
}

fn box_rows(boxes: &ArrayD<f32>) -> Result<Array2<f32>, PredictorError> {
    let shape = boxes.shape();
    // Graphs emit a single placeholder value when nothing was detected.
    if shape.len() != 2 || shape[1] < BOX_COLUMNS {
        if boxes.len() < BOX_COLUMNS {
            debug!(?shape, "box output holds no detections");
            return Ok(Array2::zeros((0, BOX_COLUMNS)));
        }
        return Err(PredictorError::InvalidOutput(format!(
            "box output has shape {shape:?}, expected [N, {BOX_COLUMNS}]"
        )));
    }
    let rows = boxes
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| PredictorError::InvalidOutput(e.to_string()))?;
    Ok(rows.slice(s![.., ..BOX_COLUMNS]).to_owned())
}

/// Splits box rows by image using the per-image counts output, if the
/// graph exports one.
fn split_rows(
    total: usize,
    counts: Option<&Tensor>,
    batch_size: usize,
) -> Result<Vec<Range<usize>>, PredictorError> {
    match counts {
        Some(counts) => {
            let counts = counts.to_i64();
            if counts.len() != batch_size {
                return Err(PredictorError::InvalidOutput(format!(
                    "bbox_num has {} entries for a batch of {batch_size}",
                    counts.len()
                )));
            }
            let mut ranges = Vec::with_capacity(batch_size);
            let mut start = 0usize;
            for &count in counts.iter() {
                let end = start + count.max(0) as usize;
                ranges.push(start..end);
                start = end;
            }
            if start != total {
                return Err(PredictorError::InvalidOutput(format!(
                    "bbox_num sums to {start} but {total} boxes were returned"
                )));
            }
            Ok(ranges)
        }
        None if batch_size == 1 => Ok(vec![0..total]),
        None if total == 0 => Ok(vec![0..0; batch_size]),
        None => Err(PredictorError::InvalidOutput(format!(
            "cannot assign {total} boxes to a batch of {batch_size} without bbox_num"
        ))),
    }
}

fn mask_planes(
    mask: ArrayD<f32>,
    boxes: usize,
    resolution: usize,
) -> Result<Array4<f32>, PredictorError> {
    if boxes == 0 {
        return Ok(Array4::zeros((0, 1, resolution, resolution)));
    }
    let mask = mask
        .into_dimensionality::<Ix4>()
        .map_err(|_| PredictorError::InvalidOutput("mask output must be 4-dimensional".into()))?;
    let (n, _, h, w) = mask.dim();
    if n != boxes {
        return Err(PredictorError::InvalidOutput(format!(
            "{n} masks for {boxes} boxes"
        )));
    }
    if h != resolution || w != resolution {
        return Err(PredictorError::InvalidOutput(format!(
            "mask output is {h}x{w}, expected mask head resolution {resolution}"
        )));
    }
    Ok(mask)
}

/// Scales one `R x R` mask-head plane into its box and pastes it into an
/// `original`-sized binary mask.
pub fn paste_mask(plane: ArrayView2<'_, f32>, bbox: [f32; 4], original: (usize, usize)) -> Array2<u8> {
    let (im_h, im_w) = original;
    let mut out = Array2::<u8>::zeros((im_h, im_w));
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 || bbox.iter().any(|v| !v.is_finite()) {
        return out;
    }

    // One pixel of zero border on each side, so the box is grown to match.
    let mut padded = Array2::<f32>::zeros((rows + 2, cols + 2));
    padded.slice_mut(s![1..=rows, 1..=cols]).assign(&plane);
    let scale_x = (cols + 2) as f32 / cols as f32;
    let scale_y = (rows + 2) as f32 / rows as f32;

    let [x1, y1, x2, y2] = bbox;
    let half_w = (x2 - x1) * 0.5 * scale_x;
    let half_h = (y2 - y1) * 0.5 * scale_y;
    let cx = (x2 + x1) * 0.5;
    let cy = (y2 + y1) * 0.5;
    let x0 = (cx - half_w) as i64;
    let y0 = (cy - half_h) as i64;
    let x1 = (cx + half_w) as i64;
    let y1 = (cy + half_h) as i64;

    let w = x1.saturating_sub(x0).saturating_add(1).max(1);
    let h = y1.saturating_sub(y0).saturating_add(1).max(1);
    if w > MAX_PASTE_SIDE || h > MAX_PASTE_SIDE {
        debug!(w, h, "box too large to paste a mask into");
        return out;
    }
    let (w, h) = (w as usize, h as usize);
    let resized = input::resize_plane(padded.view(), h, w, FilterType::Triangle);

    let left = x0.max(0);
    let right = x1.saturating_add(1).min(im_w as i64);
    let top = y0.max(0);
    let bottom = y1.saturating_add(1).min(im_h as i64);
    if left >= right || top >= bottom {
        return out;
    }
    let src = resized.slice(s![
        (top - y0) as usize..(bottom - y0) as usize,
        (left - x0) as usize..(right - x0) as usize
    ]);
    out.slice_mut(s![top as usize..bottom as usize, left as usize..right as usize])
        .zip_mut_with(&src, |dst, &v| *dst = u8::from(v > MASK_THRESHOLD));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ImageShape;

    fn descriptor(model_name: &str, num_classes: usize, labels: &[&str], with_fpn: bool) -> ModelDescriptor {
        let yaml = format!(
            "Model: {model_name}\n_Attributes:\n  model_type: detector\n  num_classes: {num_classes}\n  labels: [{}]\n_init_params:\n  with_fpn: {with_fpn}\nstatus: Infer\n",
            labels.join(", ")
        );
        ModelDescriptor::from_yaml_str(&yaml).unwrap()
    }

    fn boxes(rows: &[[f32; 6]]) -> Tensor {
        Tensor::from_f32(&[rows.len(), 6], rows.iter().flatten().copied().collect()).unwrap()
    }

    #[test]
    fn yolo_boxes_become_xywh() {
        let descriptor = descriptor("YOLOv3", 2, &["cat", "dog"], false);
        let outputs = InferenceOutput::new(vec![(
            "bbox".into(),
            boxes(&[[1.0, 0.9, 10.0, 20.0, 29.0, 59.0]]),
        )]);
        let results = postprocess(ModelKind::YoloDetector, &descriptor, &outputs, 1, None).unwrap();
        let detections = results[0].as_detections().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category, "dog");
        assert_eq!(detections[0].bbox, [10.0, 20.0, 20.0, 40.0]);
        assert!(detections[0].mask.is_none());
    }

    #[test]
    fn placeholder_output_means_no_detections() {
        let descriptor = descriptor("FasterRCNN", 3, &["a", "b"], false);
        let outputs = InferenceOutput::new(vec![(
            "bbox".into(),
            Tensor::from_f32(&[1, 1], vec![-1.0]).unwrap(),
        )]);
        let results =
            postprocess(ModelKind::RegionProposalDetector, &descriptor, &outputs, 1, None).unwrap();
        assert!(results[0].as_detections().unwrap().is_empty());
    }

    #[test]
    fn region_proposal_labels_skip_background() {
        let descriptor = descriptor("FasterRCNN", 3, &["a", "b"], false);
        let outputs = InferenceOutput::new(vec![(
            "bbox".into(),
            boxes(&[[2.0, 0.8, 0.0, 0.0, 4.0, 4.0]]),
        )]);
        let results =
            postprocess(ModelKind::RegionProposalDetector, &descriptor, &outputs, 1, None).unwrap();
        assert_eq!(results[0].as_detections().unwrap()[0].category, "b");
    }

    #[test]
    fn bbox_num_splits_rows_per_image() {
        let descriptor = descriptor("YOLOv3", 1, &["x"], false);
        let outputs = InferenceOutput::new(vec![
            (
                "bbox".into(),
                boxes(&[
                    [0.0, 0.9, 0.0, 0.0, 1.0, 1.0],
                    [0.0, 0.8, 0.0, 0.0, 2.0, 2.0],
                    [0.0, 0.7, 0.0, 0.0, 3.0, 3.0],
                ]),
            ),
            ("bbox_num".into(), Tensor::from_i32(&[2], vec![1, 2]).unwrap()),
        ]);
        let results = postprocess(ModelKind::YoloDetector, &descriptor, &outputs, 2, None).unwrap();
        assert_eq!(results[0].as_detections().unwrap().len(), 1);
        assert_eq!(results[1].as_detections().unwrap().len(), 2);
    }

    #[test]
    fn multi_image_batch_without_counts_is_rejected() {
        let descriptor = descriptor("YOLOv3", 1, &["x"], false);
        let outputs = InferenceOutput::new(vec![(
            "bbox".into(),
            boxes(&[[0.0, 0.9, 0.0, 0.0, 1.0, 1.0]]),
        )]);
        let err = postprocess(ModelKind::YoloDetector, &descriptor, &outputs, 2, None).unwrap_err();
        assert!(matches!(err, PredictorError::InvalidOutput(_)));
    }

    #[test]
    fn masks_are_pasted_into_the_original_frame() {
        let descriptor = descriptor("MaskRCNN", 2, &["person"], false);
        let resolution = descriptor.mask_head_resolution().unwrap();
        let outputs = InferenceOutput::new(vec![
            ("bbox".into(), boxes(&[[1.0, 0.95, 4.0, 4.0, 11.0, 11.0]])),
            (
                "mask".into(),
                Tensor::F32(Array4::from_elem((1, 2, resolution, resolution), 1.0).into_dyn()),
            ),
        ]);
        let shape_info = ShapeInfo {
            images: vec![ImageShape {
                original: (20, 20),
                transformed: (20, 20),
                records: Vec::new(),
            }],
        };
        let results = postprocess(
            ModelKind::InstanceSegmentationDetector,
            &descriptor,
            &outputs,
            1,
            Some((resolution, &shape_info)),
        )
        .unwrap();
        let detection = &results[0].as_detections().unwrap()[0];
        assert_eq!(detection.category, "person");
        let mask = detection.mask.as_ref().unwrap();
        assert_eq!(mask.dim(), (20, 20));
        assert_eq!(mask[[7, 7]], 1);
        assert_eq!(mask[[0, 0]], 0);
        assert_eq!(mask[[19, 19]], 0);
    }

    #[test]
    fn mask_side_must_match_head_resolution() {
        let descriptor = descriptor("MaskRCNN", 2, &["person"], true);
        let outputs = InferenceOutput::new(vec![
            ("bbox".into(), boxes(&[[1.0, 0.95, 4.0, 4.0, 11.0, 11.0]])),
            (
                "mask".into(),
                Tensor::F32(Array4::zeros((1, 2, 14, 14)).into_dyn()),
            ),
        ]);
        let shape_info = ShapeInfo {
            images: vec![ImageShape {
                original: (20, 20),
                transformed: (20, 20),
                records: Vec::new(),
            }],
        };
        let err = postprocess(
            ModelKind::InstanceSegmentationDetector,
            &descriptor,
            &outputs,
            1,
            Some((descriptor.mask_head_resolution().unwrap(), &shape_info)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("28"));
    }

    #[test]
    fn non_finite_boxes_are_rejected() {
        let descriptor = descriptor("YOLOv3", 1, &["x"], false);
        let outputs = InferenceOutput::new(vec![(
            "bbox".into(),
            boxes(&[[0.0, 0.9, 0.0, 0.0, f32::INFINITY, 4.0]]),
        )]);
        let err = postprocess(ModelKind::YoloDetector, &descriptor, &outputs, 1, None).unwrap_err();
        assert!(matches!(err, PredictorError::InvalidOutput(_)));
    }

    #[test]
    fn paste_mask_ignores_degenerate_boxes() {
        let plane = Array2::<f32>::ones((14, 14));
        let infinite = paste_mask(plane.view(), [0.0, 0.0, f32::INFINITY, 4.0], (8, 8));
        assert_eq!(infinite.dim(), (8, 8));
        assert!(infinite.iter().all(|&v| v == 0));

        let huge = paste_mask(plane.view(), [0.0, 0.0, 1.0e12, 4.0], (8, 8));
        assert!(huge.iter().all(|&v| v == 0));
    }

    #[test]
    fn paste_mask_clips_to_image_bounds() {
        let plane = Array2::<f32>::ones((4, 4));
        let mask = paste_mask(plane.view(), [-5.0, -5.0, 3.0, 3.0], (6, 6));
        assert_eq!(mask[[0, 0]], 1);
        assert_eq!(mask[[5, 5]], 0);
    }
}
