use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use inkscale_core::bitmap::{Bitmap, OutputFormat};
use inkscale_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use inkscale_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use inkscale_core::upscale::{ExecutionProvider, OrtRuntime, Upscaler};

#[derive(Parser)]
#[command(name = "inkscale", about = "Neural upscaling for comic and manga pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale an image with the configured model.
    Upscale(UpscaleArgs),
    /// Resample an image with Lanczos3.
    Resize(ResizeArgs),
    /// Build a session and print its metadata as JSON.
    Inspect(SessionArgs),
}

#[derive(Args)]
struct SessionArgs {
    #[arg(long, help = "Model file (falls back to [upscaler].model)")]
    model: Option<PathBuf>,
    #[arg(
        long,
        value_parser = parse_provider,
        help = "cpu, cuda, rocm, directml, tensorrt or webgpu"
    )]
    provider: Option<ExecutionProvider>,
    #[arg(long, help = "GPU device index")]
    device: Option<i32>,
}

#[derive(Args)]
struct UpscaleArgs {
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (default: <input>.upscaled.png)")]
    output: Option<PathBuf>,
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, help = "Tile edge in pixels, 0 disables tiling")]
    tile_size: Option<u32>,
}

#[derive(Args)]
struct ResizeArgs {
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long)]
    width: u32,
    #[arg(long, help = "Defaults to preserving the aspect ratio")]
    height: Option<u32>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    inkscale_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    inkscale_core::runtime::log_runtime_lib_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &resolved_data_dir),
        Commands::Resize(args) => run_resize(args),
        Commands::Inspect(args) => run_inspect(args, &resolved_data_dir),
    }
}

fn parse_provider(value: &str) -> std::result::Result<ExecutionProvider, String> {
    let provider = ExecutionProvider::from_str_lossy(value);
    if provider == ExecutionProvider::Cpu && !value.eq_ignore_ascii_case("cpu") {
        return Err(format!(
            "unknown execution provider '{value}' (expected cpu, cuda, rocm, directml, tensorrt or webgpu)"
        ));
    }
    Ok(provider)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// A model argument is taken as-is when it names an existing file, otherwise
/// it is looked up in the models directory.
fn resolve_model_path(models_dir: &Path, model: &Path) -> PathBuf {
    if model.is_file() {
        model.to_path_buf()
    } else {
        resolve_relative_to(models_dir, model)
    }
}

fn build_upscaler(
    config: &AppConfig,
    data_dir: &Path,
    overrides: &SessionArgs,
) -> Result<Upscaler<OrtRuntime>> {
    let runtime = OrtRuntime::new(config.trt_cache_dir(data_dir))
        .context("ONNX Runtime is not usable")?;
    let upscaler = Upscaler::new(runtime);
    let models_dir = config.models_dir(data_dir);
    config.upscaler.apply(&upscaler, &models_dir);

    if let Some(model) = &overrides.model {
        upscaler.set_model_path(resolve_model_path(&models_dir, model));
    }
    if overrides.provider.is_some() || overrides.device.is_some() {
        let current = upscaler.session_config();
        upscaler.set_execution_provider(
            overrides.provider.unwrap_or(current.execution_provider),
            overrides.device.unwrap_or(current.device_id),
        );
    }
    if upscaler.session_config().model_path.is_none() {
        bail!("no model configured: pass --model or set [upscaler].model in config.toml");
    }
    Ok(upscaler)
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}.upscaled.png"))
}

fn output_format_for(path: &Path) -> OutputFormat {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    OutputFormat::from_extension(ext).unwrap_or_else(|| {
        warn!(path = %path.display(), "Unrecognised output extension, writing PNG");
        OutputFormat::Png
    })
}

fn read_bitmap(path: &Path) -> Result<Bitmap> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Bitmap::decode(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

fn write_bitmap(bitmap: &Bitmap, path: &Path) -> Result<()> {
    let encoded = bitmap
        .encode(output_format_for(path))
        .with_context(|| format!("failed to encode {}", path.display()))?;
    std::fs::write(path, encoded).with_context(|| format!("failed to write {}", path.display()))
}

fn run_upscale(args: UpscaleArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let upscaler = build_upscaler(&config, data_dir, &args.session)?;
    if let Some(tile_size) = args.tile_size {
        upscaler.set_tile_size(tile_size);
    }

    let image = read_bitmap(&args.input)?;
    let output = args.output.unwrap_or_else(|| default_output_path(&args.input));

    let started = Instant::now();
    let result = upscaler
        .upscale(&image)
        .with_context(|| format!("failed to upscale {}", args.input.display()))?;
    info!(
        input = %args.input.display(),
        output = %output.display(),
        width = result.width(),
        height = result.height(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Upscaled image"
    );

    write_bitmap(&result, &output)
}

fn run_resize(args: ResizeArgs) -> Result<()> {
    let image = read_bitmap(&args.input)?;
    let height = args.height.unwrap_or_else(|| {
        let scaled = image.height() as u64 * args.width as u64 / image.width() as u64;
        scaled.max(1) as u32
    });
    let resized = image.resize(args.width, height)?;
    info!(
        input = %args.input.display(),
        width = resized.width(),
        height = resized.height(),
        "Resized image"
    );
    write_bitmap(&resized, &args.output)
}

fn run_inspect(args: SessionArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let upscaler = build_upscaler(&config, data_dir, &args)?;
    let info = upscaler.session_info()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
