use std::collections::BTreeMap;

use ndarray::{Array4, Axis, s};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    engine::Tensor,
    error::PredictorError,
    input::ImageInput,
    model::ModelKind,
    transforms::{ComposedTransforms, ImageSample, ShapeRecord},
};

/// Thread count used for per-image work in batch calls unless the caller
/// asks for something else.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Geometry of one image, from decode to the tensor handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageShape {
    /// `(height, width)` as decoded.
    pub original: (usize, usize),
    /// `(height, width)` after the transform pipeline, before the batch was
    /// padded to a common size.
    pub transformed: (usize, usize),
    pub records: Vec<ShapeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeInfo {
    pub images: Vec<ImageShape>,
}

impl ShapeInfo {
    pub fn get(&self, index: usize) -> Option<&ImageShape> {
        self.images.get(index)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Named input tensors for one engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedBatch {
    tensors: BTreeMap<String, Tensor>,
    shape_info: Option<ShapeInfo>,
    batch_size: usize,
}

impl PreprocessedBatch {
    pub fn new(batch_size: usize) -> Self {
        Self {
            tensors: BTreeMap::new(),
            shape_info: None,
            batch_size,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn with_shape_info(mut self, shape_info: ShapeInfo) -> Self {
        self.shape_info = Some(shape_info);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn shape_info(&self) -> Option<&ShapeInfo> {
        self.shape_info.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Decodes, transforms and batches `images` into the slots `kind` needs.
pub fn preprocess(
    kind: ModelKind,
    transforms: &ComposedTransforms,
    images: &[ImageInput],
    concurrency: usize,
) -> Result<PreprocessedBatch, PredictorError> {
    if images.is_empty() {
        return Err(PredictorError::BadInput("no images to preprocess".into()));
    }
    let samples = transform_all(transforms, images, concurrency)?;
    let mut batch = PreprocessedBatch::new(samples.len());
    batch.insert("image", Tensor::F32(stack_nchw(&samples)?.into_dyn()));

    match kind {
        ModelKind::Classifier => {}
        ModelKind::YoloDetector => {
            let data = samples
                .iter()
                .flat_map(|s| [s.original.0 as i32, s.original.1 as i32])
                .collect();
            batch.insert("im_size", Tensor::from_i32(&[samples.len(), 2], data)?);
        }
        ModelKind::RegionProposalDetector | ModelKind::InstanceSegmentationDetector => {
            let im_info = samples
                .iter()
                .flat_map(|s| [s.resized.0 as f32, s.resized.1 as f32, s.scale])
                .collect();
            let im_shape = samples
                .iter()
                .flat_map(|s| [s.original.0 as f32, s.original.1 as f32, 1.0])
                .collect();
            batch.insert("im_info", Tensor::from_f32(&[samples.len(), 3], im_info)?);
            batch.insert("im_shape", Tensor::from_f32(&[samples.len(), 3], im_shape)?);
            batch = batch.with_shape_info(shape_info(&samples));
        }
        ModelKind::Segmenter => {
            batch = batch.with_shape_info(shape_info(&samples));
        }
    }

    debug!(
        ?kind,
        batch_size = batch.batch_size(),
        slots = ?batch.iter().map(|(name, t)| (name, t.shape().to_vec())).collect::<Vec<_>>(),
        "preprocessed batch"
    );
    Ok(batch)
}

fn transform_all(
    transforms: &ComposedTransforms,
    images: &[ImageInput],
    concurrency: usize,
) -> Result<Vec<ImageSample>, PredictorError> {
    let work = |image: &ImageInput| transforms.apply(image.to_bgr_array()?);
    if concurrency <= 1 || images.len() == 1 {
        return images.iter().map(work).collect();
    }
    match rayon::ThreadPoolBuilder::new().num_threads(concurrency).build() {
        Ok(pool) => pool.install(|| images.par_iter().map(work).collect()),
        Err(err) => {
            warn!(%err, concurrency, "could not build preprocessing pool, running inline");
            images.iter().map(work).collect()
        }
    }
}

/// Stacks HWC samples into one zero-padded NCHW batch.
fn stack_nchw(samples: &[ImageSample]) -> Result<Array4<f32>, PredictorError> {
    let channels = samples[0].data.dim().2;
    if samples.iter().any(|s| s.data.dim().2 != channels) {
        return Err(PredictorError::BadInput(
            "images in a batch must have the same channel count".into(),
        ));
    }
    let max_h = samples.iter().map(|s| s.size().0).max().unwrap_or(0);
    let max_w = samples.iter().map(|s| s.size().1).max().unwrap_or(0);

    let mut batch = Array4::<f32>::zeros((samples.len(), channels, max_h, max_w));
    for (mut slot, sample) in batch.axis_iter_mut(Axis(0)).zip(samples) {
        let (h, w) = sample.size();
        let chw = sample.data.view().permuted_axes([2, 0, 1]);
        slot.slice_mut(s![.., ..h, ..w]).assign(&chw);
    }
    Ok(batch)
}

fn shape_info(samples: &[ImageSample]) -> ShapeInfo {
    ShapeInfo {
        images: samples
            .iter()
            .map(|s| ImageShape {
                original: s.original,
                transformed: s.size(),
                records: s.records.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;
    use serde_yaml::Mapping;

    use super::*;
    use crate::transforms::TransformSpec;

    fn no_transforms(kind: ModelKind) -> ComposedTransforms {
        ComposedTransforms::build(kind, &[], false).unwrap()
    }

    #[test]
    fn classifier_batch_has_only_the_image_slot() {
        let images = vec![ImageInput::Array(Array3::from_elem((2, 3, 3), 1.0))];
        let batch = preprocess(ModelKind::Classifier, &no_transforms(ModelKind::Classifier), &images, 1)
            .unwrap();
        assert_eq!(batch.batch_size(), 1);
        assert_eq!(batch.get("image").unwrap().shape(), &[1, 3, 2, 3]);
        assert_eq!(batch.iter().count(), 1);
        assert!(batch.shape_info().is_none());
    }

    #[test]
    fn yolo_batch_carries_original_sizes() {
        let images = vec![
            ImageInput::Array(Array3::zeros((4, 6, 3))),
            ImageInput::Array(Array3::zeros((5, 2, 3))),
        ];
        let batch = preprocess(
            ModelKind::YoloDetector,
            &no_transforms(ModelKind::YoloDetector),
            &images,
            2,
        )
        .unwrap();
        assert_eq!(batch.get("image").unwrap().shape(), &[2, 3, 5, 6]);
        let im_size = batch.get("im_size").unwrap();
        assert_eq!(im_size, &Tensor::from_i32(&[2, 2], vec![4, 6, 5, 2]).unwrap());
    }

    #[test]
    fn region_proposal_batch_carries_resize_info() {
        let mut params = Mapping::new();
        params.insert("short_size".into(), 8.into());
        params.insert("max_size".into(), 1333.into());
        let transforms = ComposedTransforms::build(
            ModelKind::RegionProposalDetector,
            &[TransformSpec::new("ResizeByShort", params)],
            true,
        )
        .unwrap();
        let images = vec![ImageInput::Array(Array3::zeros((4, 6, 3)))];
        let batch = preprocess(ModelKind::RegionProposalDetector, &transforms, &images, 1).unwrap();

        assert_eq!(
            batch.get("im_info").unwrap(),
            &Tensor::from_f32(&[1, 3], vec![8.0, 12.0, 2.0]).unwrap()
        );
        assert_eq!(
            batch.get("im_shape").unwrap(),
            &Tensor::from_f32(&[1, 3], vec![4.0, 6.0, 1.0]).unwrap()
        );
        let info = batch.shape_info().unwrap();
        assert_eq!(info.get(0).unwrap().original, (4, 6));
    }

    #[test]
    fn stacking_pads_smaller_images_with_zeros() {
        let images = vec![
            ImageInput::Array(Array3::from_elem((1, 1, 3), 5.0)),
            ImageInput::Array(Array3::from_elem((2, 2, 3), 7.0)),
        ];
        let batch = preprocess(ModelKind::Segmenter, &no_transforms(ModelKind::Segmenter), &images, 1)
            .unwrap();
        let image = batch.get("image").unwrap().as_f32().unwrap();
        assert_eq!(image[[0, 0, 0, 0]], 5.0);
        assert_eq!(image[[0, 0, 1, 1]], 0.0);
        assert_eq!(image[[1, 2, 1, 1]], 7.0);
        let info = batch.shape_info().unwrap();
        assert_eq!(info.get(0).unwrap().transformed, (1, 1));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = preprocess(ModelKind::Classifier, &no_transforms(ModelKind::Classifier), &[], 1)
            .unwrap_err();
        assert!(matches!(err, PredictorError::BadInput(_)));
    }
}
