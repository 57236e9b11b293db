use std::{collections::HashMap, path::Path, time::Instant};

use tch::{CModule, Device, IValue, Kind, TchError, no_grad};
use tracing::{debug, info, warn};

use crate::{
    config::{DeviceSpec, EngineConfig},
    engine::{InferenceEngine, Tensor},
    error::PredictorError,
};

/// TorchScript engine. Inputs are passed to `forward` positionally in the
/// declared input order; a tuple result is matched to the declared outputs.
pub struct TorchEngine {
    module: CModule,
    device: Device,
    input_names: Vec<String>,
    output_names: Vec<String>,
    required_outputs: usize,
    inputs: HashMap<String, tch::Tensor>,
    outputs: HashMap<String, tch::Tensor>,
    release_inputs: bool,
    verbose: bool,
}

impl TorchEngine {
    pub fn load(config: &EngineConfig) -> Result<Self, PredictorError> {
        if !config.model_path.is_file() {
            return Err(PredictorError::MissingArtifact(config.model_path.clone()));
        }
        let device = resolve_device(config.device);

        if config.use_mkl && !tch::utils::has_mkldnn() {
            warn!("MKL-DNN acceleration requested but libtorch was built without it");
        }

        let mut module = CModule::load_on_device(&config.model_path, device).map_err(engine_error)?;
        // Graph fusion happens inside the TorchScript executor once the
        // module is frozen for inference.
        module.set_eval();

        if config.params_path.is_file() {
            load_params(&module, &config.params_path, device)?;
        }

        info!(
            model = %config.model_path.display(),
            ?device,
            inputs = ?config.input_names,
            outputs = ?config.output_names,
            "torchscript engine ready"
        );

        Ok(Self {
            module,
            device,
            input_names: config.input_names.clone(),
            output_names: config.output_names.clone(),
            required_outputs: config.required_outputs,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            release_inputs: config.memory_optimize,
            verbose: config.use_glog,
        })
    }
}

impl InferenceEngine for TorchEngine {
    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn set_input(&mut self, name: &str, tensor: &Tensor) -> Result<(), PredictorError> {
        let value = to_torch(tensor, self.device);
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    fn run(&mut self) -> Result<(), PredictorError> {
        let mut args = Vec::with_capacity(self.input_names.len());
        for name in &self.input_names {
            let tensor = self.inputs.get(name).ok_or_else(|| {
                PredictorError::EngineExecution(format!("input slot {name:?} is not bound"))
            })?;
            args.push(IValue::Tensor(tensor.shallow_clone()));
        }

        let started = Instant::now();
        let result = no_grad(|| self.module.forward_is(&args)).map_err(engine_error)?;
        let tensors = flatten_result(result)?;
        if tensors.len() < self.required_outputs || tensors.len() > self.output_names.len() {
            return Err(PredictorError::EngineExecution(format!(
                "graph returned {} outputs, expected {} to {}",
                tensors.len(),
                self.required_outputs,
                self.output_names.len()
            )));
        }
        self.outputs = self.output_names.iter().cloned().zip(tensors).collect();

        if self.release_inputs {
            self.inputs.clear();
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if self.verbose {
            info!(elapsed_ms, "forward pass finished");
        } else {
            debug!(elapsed_ms, "forward pass finished");
        }
        Ok(())
    }

    fn has_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    fn output(&self, name: &str) -> Result<Tensor, PredictorError> {
        let tensor = self.outputs.get(name).ok_or_else(|| {
            PredictorError::EngineExecution(format!("output slot {name:?} was not produced"))
        })?;
        from_torch(tensor)
    }
}

fn resolve_device(spec: DeviceSpec) -> Device {
    match spec {
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Gpu(idx) => {
            let available = tch::Cuda::is_available() && (idx as i64) < tch::Cuda::device_count();
            if available {
                Device::Cuda(idx)
            } else {
                warn!(gpu_id = idx, "CUDA device unavailable, falling back to CPU");
                Device::Cpu
            }
        }
    }
}

/// Overlays named tensors from the parameter archive onto the module.
fn load_params(module: &CModule, path: &Path, device: Device) -> Result<(), PredictorError> {
    let stored = tch::Tensor::load_multi_with_device(path, device).map_err(engine_error)?;
    let stored: HashMap<String, tch::Tensor> = stored.into_iter().collect();
    let mut copied = 0usize;
    for (name, mut param) in module.named_parameters().map_err(engine_error)? {
        if let Some(src) = stored.get(&name) {
            no_grad(|| param.f_copy_(src)).map_err(engine_error)?;
            copied += 1;
        }
    }
    if copied < stored.len() {
        warn!(
            copied,
            stored = stored.len(),
            "parameter archive holds tensors the graph does not declare"
        );
    }
    debug!(copied, path = %path.display(), "loaded parameter archive");
    Ok(())
}

fn flatten_result(result: IValue) -> Result<Vec<tch::Tensor>, PredictorError> {
    match result {
        IValue::Tensor(t) => Ok(vec![t]),
        IValue::TensorList(list) => Ok(list),
        IValue::Tuple(items) | IValue::GenericList(items) => items
            .into_iter()
            .map(|item| match item {
                IValue::Tensor(t) => Ok(t),
                other => Err(PredictorError::EngineExecution(format!(
                    "expected tensor output, got {other:?}"
                ))),
            })
            .collect(),
        other => Err(PredictorError::EngineExecution(format!(
            "unexpected graph output {other:?}"
        ))),
    }
}

fn to_torch(tensor: &Tensor, device: Device) -> tch::Tensor {
    let shape: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
    let flat = match tensor {
        Tensor::F32(a) => tch::Tensor::from_slice(&a.iter().copied().collect::<Vec<f32>>()),
        Tensor::I32(a) => tch::Tensor::from_slice(&a.iter().copied().collect::<Vec<i32>>()),
        Tensor::I64(a) => tch::Tensor::from_slice(&a.iter().copied().collect::<Vec<i64>>()),
    };
    flat.reshape(shape.as_slice()).to_device(device)
}

fn from_torch(tensor: &tch::Tensor) -> Result<Tensor, PredictorError> {
    let host = tensor.to_device(Device::Cpu).contiguous();
    let shape: Vec<usize> = host.size().iter().map(|&d| d as usize).collect();
    let flat = host.flatten(0, -1);
    match host.kind() {
        Kind::Int64 => Tensor::from_i64(&shape, Vec::<i64>::try_from(&flat).map_err(engine_error)?),
        Kind::Int | Kind::Int16 | Kind::Int8 | Kind::Uint8 | Kind::Bool => {
            let flat = flat.to_kind(Kind::Int);
            Tensor::from_i32(&shape, Vec::<i32>::try_from(&flat).map_err(engine_error)?)
        }
        _ => {
            let flat = flat.to_kind(Kind::Float);
            Tensor::from_f32(&shape, Vec::<f32>::try_from(&flat).map_err(engine_error)?)
        }
    }
}

fn engine_error(err: TchError) -> PredictorError {
    PredictorError::EngineExecution(err.to_string())
}
