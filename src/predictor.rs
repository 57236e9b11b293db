use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{debug, info, warn};

use crate::{
    config::{EngineConfig, PredictorOptions},
    engine::{self, InferenceEngine, InferenceOutput},
    error::PredictorError,
    input::ImageInput,
    model::{ModelDescriptor, ModelKind, ModelMetadata, PredictionResult},
    postprocess::Postprocessor,
    preprocess::{self, PreprocessedBatch, ShapeInfo},
    transforms::ComposedTransforms,
};

/// Runs an exported model directory end to end: preprocess, forward pass,
/// postprocess.
///
/// The engine handle is exclusively owned and released on drop. Calls that
/// touch the engine take `&mut self`; share a predictor between threads by
/// putting it behind a mutex.
pub struct Predictor {
    model_dir: PathBuf,
    options: PredictorOptions,
    descriptor: ModelDescriptor,
    kind: ModelKind,
    transforms: ComposedTransforms,
    engine: Box<dyn InferenceEngine>,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("model_dir", &self.model_dir)
            .field("kind", &self.kind)
            .field("model_name", &self.descriptor.model_name)
            .finish_non_exhaustive()
    }
}

impl Predictor {
    /// Opens `model_dir` with the engine backend compiled into this build.
    pub fn open(model_dir: impl AsRef<Path>, options: PredictorOptions) -> Result<Self, PredictorError> {
        Self::with_engine(model_dir, options, engine::create_engine)
    }

    /// Opens `model_dir`, building the engine with `factory` once the
    /// descriptor and transforms have been validated.
    pub fn with_engine<F>(
        model_dir: impl AsRef<Path>,
        options: PredictorOptions,
        factory: F,
    ) -> Result<Self, PredictorError>
    where
        F: FnOnce(&EngineConfig) -> Result<Box<dyn InferenceEngine>, PredictorError>,
    {
        let model_dir = model_dir.as_ref();
        let descriptor = ModelDescriptor::load(model_dir)?;
        let kind = ModelKind::resolve(&descriptor.model_type, &descriptor.model_name)?;
        let transforms = ComposedTransforms::build(kind, &descriptor.transforms, descriptor.to_rgb())?;

        if options.use_trt {
            warn!("use_trt is accepted but no engine backend wires TensorRT up; ignoring");
        }
        let config = EngineConfig::new(model_dir, &options)
            .with_signature(kind.input_names(), kind.output_names())
            .with_required_outputs(kind.required_outputs());
        let engine = factory(&config)?;

        info!(
            model = %descriptor.model_name,
            ?kind,
            status = ?descriptor.status,
            device = ?config.device,
            num_classes = descriptor.num_classes,
            "predictor ready"
        );

        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            options,
            descriptor,
            kind,
            transforms,
            engine,
        })
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn options(&self) -> &PredictorOptions {
        &self.options
    }

    pub fn transforms(&self) -> &ComposedTransforms {
        &self.transforms
    }

    pub fn mask_head_resolution(&self) -> Option<usize> {
        self.descriptor.mask_head_resolution()
    }

    pub fn metadata(&self) -> ModelMetadata {
        let size_of = |path: PathBuf| fs::metadata(path).ok().map(|m| m.len());
        ModelMetadata {
            name: self.descriptor.model_name.clone(),
            model_type: self.descriptor.model_type.clone(),
            kind: self.kind,
            status: self.descriptor.status,
            quantized: self.descriptor.is_quantized(),
            num_classes: self.descriptor.num_classes,
            labels: self.descriptor.labels.clone(),
            model_size_bytes: size_of(self.model_dir.join(crate::config::MODEL_FILE)),
            params_size_bytes: size_of(self.model_dir.join(crate::config::PARAMS_FILE)),
        }
    }

    pub fn preprocess(
        &self,
        images: &[ImageInput],
        concurrency: usize,
    ) -> Result<PreprocessedBatch, PredictorError> {
        preprocess::preprocess(self.kind, &self.transforms, images, concurrency)
    }

    /// Binds every slot the engine declares, runs it, and collects the
    /// declared outputs in order. Input slots the engine does not know and
    /// optional outputs it did not produce are skipped.
    pub fn raw_predict(&mut self, batch: &PreprocessedBatch) -> Result<InferenceOutput, PredictorError> {
        for (name, tensor) in batch.iter() {
            if !self.engine.input_names().iter().any(|slot| slot == name) {
                debug!(slot = name, "engine does not declare input slot, skipping");
                continue;
            }
            self.engine.set_input(name, tensor)?;
        }

        let started = Instant::now();
        self.engine.run()?;
        debug!(
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            batch_size = batch.batch_size(),
            "engine run finished"
        );

        let names = self.engine.output_names().to_vec();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            if self.kind.is_optional_output(&name) && !self.engine.has_output(&name) {
                debug!(slot = %name, "optional output not produced");
                continue;
            }
            let tensor = self.engine.output(&name)?;
            entries.push((name, tensor));
        }
        Ok(InferenceOutput::new(entries))
    }

    pub fn postprocess(
        &self,
        outputs: &InferenceOutput,
        topk: usize,
        batch_size: usize,
        shape_info: Option<&ShapeInfo>,
    ) -> Result<Vec<PredictionResult>, PredictorError> {
        Postprocessor::new(self.kind, &self.descriptor).run(outputs, topk, batch_size, shape_info)
    }

    pub fn predict(
        &mut self,
        image: impl Into<ImageInput>,
        topk: usize,
    ) -> Result<PredictionResult, PredictorError> {
        let image = image.into();
        self.batch_predict(std::slice::from_ref(&image), topk, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| PredictorError::InvalidOutput("no result for the input image".into()))
    }

    /// Predicts `images` as one batch. Results come back in input order.
    pub fn batch_predict(
        &mut self,
        images: &[ImageInput],
        topk: usize,
        concurrency: usize,
    ) -> Result<Vec<PredictionResult>, PredictorError> {
        let batch = self.preprocess(images, concurrency)?;
        let outputs = self.raw_predict(&batch)?;
        let results = self.postprocess(&outputs, topk, batch.batch_size(), batch.shape_info())?;
        if results.len() != images.len() {
            return Err(PredictorError::InvalidOutput(format!(
                "{} results for {} images",
                results.len(),
                images.len()
            )));
        }
        Ok(results)
    }
}
