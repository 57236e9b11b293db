use std::{env, path::PathBuf};

use anyhow::{Context, bail};

/// Graph file inside an exported model directory.
pub const MODEL_FILE: &str = "__model__";
/// Parameter file inside an exported model directory.
pub const PARAMS_FILE: &str = "__params__";

/// Construction options for a [`Predictor`](crate::Predictor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorOptions {
    pub use_gpu: bool,
    pub gpu_id: usize,
    /// CPU math-library acceleration (MKL-DNN / oneDNN).
    pub use_mkl: bool,
    /// Accepted for compatibility with exported deployment scripts; no
    /// backend wires it up yet.
    pub use_trt: bool,
    /// Verbose engine logging.
    pub use_glog: bool,
    pub memory_optimize: bool,
}

impl Default for PredictorOptions {
    fn default() -> Self {
        Self {
            use_gpu: true,
            gpu_id: 0,
            use_mkl: false,
            use_trt: false,
            use_glog: false,
            memory_optimize: true,
        }
    }
}

impl PredictorOptions {
    pub fn cpu() -> Self {
        Self {
            use_gpu: false,
            ..Self::default()
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the `PREDICTOR_*` variables through `lookup`, keeping the
    /// default for every variable that is not set.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| -> anyhow::Result<bool> {
            match lookup(key) {
                Some(raw) => parse_flag(&raw).with_context(|| format!("invalid value for {key}")),
                None => Ok(default),
            }
        };

        let gpu_id = match lookup("PREDICTOR_GPU_ID") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid value for PREDICTOR_GPU_ID: {raw:?}"))?,
            None => defaults.gpu_id,
        };

        Ok(Self {
            use_gpu: flag("PREDICTOR_USE_GPU", defaults.use_gpu)?,
            gpu_id,
            use_mkl: flag("PREDICTOR_USE_MKL", defaults.use_mkl)?,
            use_trt: flag("PREDICTOR_USE_TRT", defaults.use_trt)?,
            use_glog: flag("PREDICTOR_USE_GLOG", defaults.use_glog)?,
            memory_optimize: flag("PREDICTOR_MEMORY_OPTIMIZE", defaults.memory_optimize)?,
        })
    }

    pub fn with_gpu(mut self, gpu_id: usize) -> Self {
        self.use_gpu = true;
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_mkl(mut self, enable: bool) -> Self {
        self.use_mkl = enable;
        self
    }

    pub fn with_trt(mut self, enable: bool) -> Self {
        self.use_trt = enable;
        self
    }

    pub fn with_glog(mut self, enable: bool) -> Self {
        self.use_glog = enable;
        self
    }

    pub fn with_memory_optimize(mut self, enable: bool) -> Self {
        self.memory_optimize = enable;
        self
    }

    pub fn device(&self) -> DeviceSpec {
        if self.use_gpu {
            DeviceSpec::Gpu(self.gpu_id)
        } else {
            DeviceSpec::Cpu
        }
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Gpu(usize),
}

/// Everything an engine backend needs, fixed before the engine is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub params_path: PathBuf,
    pub device: DeviceSpec,
    pub use_mkl: bool,
    pub use_glog: bool,
    pub memory_optimize: bool,
    /// Graph-level optimization (operator fusion). Always on.
    pub ir_optim: bool,
    /// Built-in feed/fetch ops. Always off: tensors are bound directly.
    pub use_feed_fetch_ops: bool,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Leading entries of `output_names` every run must produce.
    pub required_outputs: usize,
}

impl EngineConfig {
    pub fn new(model_dir: &std::path::Path, options: &PredictorOptions) -> Self {
        Self {
            model_path: model_dir.join(MODEL_FILE),
            params_path: model_dir.join(PARAMS_FILE),
            device: options.device(),
            use_mkl: options.use_mkl,
            use_glog: options.use_glog,
            memory_optimize: options.memory_optimize,
            ir_optim: true,
            use_feed_fetch_ops: false,
            input_names: Vec::new(),
            output_names: Vec::new(),
            required_outputs: 0,
        }
    }

    pub fn with_signature(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.input_names = inputs.iter().map(|s| s.to_string()).collect();
        self.output_names = outputs.iter().map(|s| s.to_string()).collect();
        self.required_outputs = self.output_names.len();
        self
    }

    pub fn with_required_outputs(mut self, required: usize) -> Self {
        self.required_outputs = required.min(self.output_names.len());
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_deployment_defaults() {
        let options = PredictorOptions::default();
        assert!(options.use_gpu);
        assert_eq!(options.gpu_id, 0);
        assert!(!options.use_mkl);
        assert!(!options.use_trt);
        assert!(!options.use_glog);
        assert!(options.memory_optimize);
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let options = PredictorOptions::from_lookup(lookup_from(&[
            ("PREDICTOR_USE_GPU", "false"),
            ("PREDICTOR_GPU_ID", "3"),
            ("PREDICTOR_USE_MKL", "1"),
            ("PREDICTOR_MEMORY_OPTIMIZE", "off"),
        ]))
        .unwrap();
        assert!(!options.use_gpu);
        assert_eq!(options.gpu_id, 3);
        assert!(options.use_mkl);
        assert!(!options.memory_optimize);
        assert_eq!(options.device(), DeviceSpec::Cpu);
    }

    #[test]
    fn env_lookup_rejects_garbage() {
        let err = PredictorOptions::from_lookup(lookup_from(&[("PREDICTOR_USE_GLOG", "maybe")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("PREDICTOR_USE_GLOG"));
    }

    #[test]
    fn engine_config_fixes_optimization_switches() {
        let options = PredictorOptions::default().with_gpu(1).with_glog(true);
        let config = EngineConfig::new(Path::new("/models/yolo"), &options)
            .with_signature(&["image", "im_size"], &["bbox"]);
        assert_eq!(config.model_path, Path::new("/models/yolo/__model__"));
        assert_eq!(config.params_path, Path::new("/models/yolo/__params__"));
        assert_eq!(config.device, DeviceSpec::Gpu(1));
        assert!(config.ir_optim);
        assert!(!config.use_feed_fetch_ops);
        assert!(config.use_glog);
        assert_eq!(config.input_names, vec!["image", "im_size"]);
        assert_eq!(config.required_outputs, 1);
    }

    #[test]
    fn required_outputs_never_exceed_declared() {
        let config = EngineConfig::new(Path::new("/models/seg"), &PredictorOptions::cpu())
            .with_signature(&["image"], &["label_map", "score_map"])
            .with_required_outputs(5);
        assert_eq!(config.required_outputs, 2);
    }
}
