use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deploy_predictor::{DEFAULT_CONCURRENCY, ImageInput, Predictor, PredictorOptions};

#[derive(Parser, Debug)]
#[command(name = "deploy_predictor")]
#[command(about = "Run an exported image model on local files", long_about = None)]
struct Cli {
    /// Exported model directory (model.yml, __model__, __params__)
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Images to predict, run as a single batch
    images: Vec<PathBuf>,

    /// Classes reported per image for classifiers
    #[arg(short = 'k', long, default_value_t = 1)]
    topk: usize,

    /// Worker threads for preprocessing
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
    threads: usize,

    /// Run on the CPU even if PREDICTOR_USE_GPU is set
    #[arg(long)]
    cpu: bool,

    /// GPU index, implies GPU execution
    #[arg(long, conflicts_with = "cpu")]
    gpu_id: Option<usize>,

    /// Enable CPU math-library acceleration
    #[arg(long)]
    mkl: bool,

    /// Verbose engine logging
    #[arg(long)]
    glog: bool,

    /// Keep engine inputs bound after each run
    #[arg(long)]
    no_memory_optimize: bool,

    /// Print model metadata instead of predicting
    #[arg(long)]
    info: bool,
}

impl Cli {
    fn options(&self) -> anyhow::Result<PredictorOptions> {
        let mut options = PredictorOptions::from_env()?;
        if self.cpu {
            options.use_gpu = false;
        }
        if let Some(gpu_id) = self.gpu_id {
            options = options.with_gpu(gpu_id);
        }
        if self.mkl {
            options = options.with_mkl(true);
        }
        if self.glog {
            options = options.with_glog(true);
        }
        if self.no_memory_optimize {
            options = options.with_memory_optimize(false);
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let options = cli.options()?;
    tracing::info!(model_dir = %cli.model_dir.display(), ?options, "opening model");
    let mut predictor = Predictor::open(&cli.model_dir, options)
        .with_context(|| format!("failed to open {}", cli.model_dir.display()))?;

    if cli.info {
        println!("{}", serde_json::to_string_pretty(&predictor.metadata())?);
        return Ok(());
    }
    if cli.images.is_empty() {
        bail!("no images given; pass one or more image paths or --info");
    }

    let inputs: Vec<ImageInput> = cli.images.iter().map(|p| ImageInput::from(p.as_path())).collect();
    let results = predictor.batch_predict(&inputs, cli.topk, cli.threads)?;

    let report: Vec<_> = cli
        .images
        .iter()
        .zip(&results)
        .map(|(path, result)| json!({ "image": path, "prediction": result }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
