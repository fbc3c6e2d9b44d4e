use std::env;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dense_onnx_export::config::{
    DEFAULT_MAX_LENGTH, DEFAULT_MODEL_ID, DEFAULT_OPSET, DEFAULT_OUT_DIR, DEFAULT_REVISION,
};
use dense_onnx_export::{Device, ExportConfig, ExportPipeline, ExternalDataMode};
use tracing_subscriber::{EnvFilter, fmt};

/// Export a dense embedding encoder to ONNX, returning `last_hidden_state`.
#[derive(Debug, Parser)]
#[command(name = "export_dense_onnx", version)]
struct ExportArgs {
    /// Hub repository id (org/name) or local model directory.
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    #[arg(long, default_value = DEFAULT_OUT_DIR)]
    out_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_OPSET)]
    opset: i64,

    /// Sequence length of the trace example; the graph itself stays dynamic.
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    max_length: usize,

    /// Re-run the exported graph in ONNX Runtime and report parity.
    #[arg(long)]
    verify: bool,

    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    device: Device,

    #[arg(long, default_value = DEFAULT_REVISION)]
    revision: String,

    /// Hub cache directory; defaults to the hf-hub cache.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    no_constant_folding: bool,

    #[arg(long, value_enum, default_value_t = ExternalDataMode::Auto)]
    external_data: ExternalDataMode,

    /// Fail when the verified max abs error exceeds this value.
    #[arg(long)]
    max_abs_tolerance: Option<f32>,

    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<ExportArgs> for ExportConfig {
    fn from(args: ExportArgs) -> Self {
        Self {
            model_id: args.model_id,
            out_dir: args.out_dir,
            opset: args.opset,
            max_length: args.max_length,
            verify: args.verify,
            device: args.device,
            revision: args.revision,
            cache_dir: args.cache_dir,
            constant_folding: !args.no_constant_folding,
            external_data: args.external_data,
            max_abs_tolerance: args.max_abs_tolerance,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = ExportArgs::parse();
    init_tracing(args.verbose);

    if env::var_os("TOKENIZERS_PARALLELISM").is_none() {
        // SAFETY: single-threaded at this point; no other thread reads the environment.
        unsafe { env::set_var("TOKENIZERS_PARALLELISM", "false") };
    }

    let pipeline = ExportPipeline::new(args.into()).context("invalid arguments")?;
    pipeline
        .run()
        .with_context(|| format!("export of {} failed", pipeline.config().model_id))?;
    Ok(())
}
