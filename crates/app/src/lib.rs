use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vksr_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use vksr_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER};
use vksr_core::model::{ModelFiles, ModelRegistry};
use vksr_core::network::{InferenceBackend, OrtLoader};
use vksr_core::tile::auto_tile_size;
use vksr_core::{DeviceRegistry, HostImage, HostImageMut, SrSession};

#[derive(Parser)]
#[command(name = "vksr", about = "Tiled GPU super-resolution for still images")]
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
    /// Upscale a PNG or JPEG image.
    Upscale(UpscaleArgs),
    /// List configured devices and their heap budgets.
    Devices(DevicesArgs),
}

#[derive(Args, Debug, Default)]
struct UpscaleArgs {
    input: PathBuf,
    output: PathBuf,
    #[arg(short = 'm', long, help = "Model directory name or path (default from config)")]
    model: Option<String>,
    #[arg(long, requires = "weights", conflicts_with = "model", help = "Explicit graph file")]
    param: Option<PathBuf>,
    #[arg(long, requires = "param", help = "Explicit weights file")]
    weights: Option<PathBuf>,
    #[arg(short = 's', long)]
    scale: Option<usize>,
    #[arg(short = 't', long, help = "Tile size in input pixels (0 = auto)")]
    tile_size: Option<usize>,
    #[arg(short = 'g', long)]
    gpu: Option<u32>,
    #[arg(short = 'x', long, help = "Enable 8-way test-time augmentation")]
    tta: bool,
    #[arg(long, help = "Context padding override in pixels")]
    prepadding: Option<usize>,
    #[arg(long, help = "cuda | tensorrt | cpu")]
    backend: Option<String>,
}

#[derive(Args)]
struct DevicesArgs {
    #[arg(long)]
    json: bool,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = vksr_core::runtime::setup_runtime_libs();
    let (config, config_warnings) = load_config(&resolved_data_dir);
    init_logging(&logging_init_options(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
        &config,
    ));
    for warning in &config_warnings {
        warn!("{warning}");
    }
    vksr_core::runtime::log_runtime_lib_status(&runtime_libs);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, &resolved_data_dir),
        Commands::Devices(args) => run_devices(&config, args.json),
    }
}

fn logging_init_options(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    config: &AppConfig,
) -> LoggingInitOptions {
    LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files: config.logging.retention_files,
        ..Default::default()
    }
}

fn init_logging(init_options: &LoggingInitOptions) {
    let panic_hook_plan = logging::install_panic_hook(init_options.data_dir.as_deref());

    let plan = logging::compose_logging_init_plan(init_options);
    let console_filter = parse_env_filter_with_fallback(&plan.filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let fallback_reason = match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback_reason {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback { reason } = panic_hook_plan {
        warn!(reason = %reason, "Panic crash artifacts disabled");
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

/// Runs before tracing is up, so problems come back as messages to log later.
fn load_config(data_dir: &Path) -> (AppConfig, Vec<String>) {
    let mut warnings = Vec::new();
    if let Err(e) = initialize_data_dir(data_dir) {
        warnings.push(format!("Failed to initialize data directory: {e:#}"));
    }
    let config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warnings.push(format!("Failed to load config file, using defaults: {err:#}"));
            AppConfig::default()
        }
    };
    (config, warnings)
}

/// Fold command-line overrides into the session section.
fn apply_overrides(config: &mut AppConfig, args: &UpscaleArgs) {
    let session = &mut config.session;
    if let Some(model) = &args.model {
        session.model = model.clone();
    }
    if let Some(scale) = args.scale {
        session.scale = scale;
    }
    if let Some(tile_size) = args.tile_size {
        session.tile_size = tile_size;
    }
    if args.gpu.is_some() {
        session.gpu_id = args.gpu;
    }
    if args.prepadding.is_some() {
        session.prepadding = args.prepadding;
    }
    if let Some(backend) = &args.backend {
        session.backend = InferenceBackend::from_str_lossy(backend);
    }
    session.tta_mode |= args.tta;
}

fn model_files(models: &ModelRegistry, config: &AppConfig, args: &UpscaleArgs) -> Result<ModelFiles> {
    match (&args.param, &args.weights) {
        (Some(param), Some(weights)) => Ok(ModelFiles {
            name: param
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            param: param.clone(),
            weights: weights.clone(),
        }),
        _ => Ok(models.resolve(&config.session.model, config.session.scale)?),
    }
}

fn run_upscale(args: UpscaleArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    apply_overrides(&mut config, &args);

    let models = ModelRegistry::with_builtin_models(resolve_relative_to(data_dir, &config.paths.models_dir));
    let files = model_files(&models, &config, &args)?;
    let prepadding = models.prepadding_for(&files.name, config.session.prepadding)?;

    let registry = DeviceRegistry::initialize(config.devices.device_list())?;
    let mut session = SrSession::new(&registry, config.session.session_config(prepadding))?;
    let loader = OrtLoader {
        config: config
            .session
            .backend_config(resolve_relative_to(data_dir, &config.paths.trt_cache_dir))?,
    };
    session.load(&loader, &files.param, &files.weights)?;

    let input = image::open(&args.input)
        .with_context(|| format!("Failed to read image: {}", args.input.display()))?;
    let started = Instant::now();
    let output = upscale_image(&session, &input)?;
    info!(
        input = %args.input.display(),
        width = output.width(),
        height = output.height(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Upscaled image"
    );
    output
        .save(&args.output)
        .with_context(|| format!("Failed to write image: {}", args.output.display()))?;

    drop(session);
    registry.shutdown()?;
    Ok(())
}

/// Run one image through the session, keeping an alpha channel if it has one.
fn upscale_image(session: &SrSession, input: &DynamicImage) -> Result<DynamicImage> {
    let scale = session.config().scale;
    let (w, h) = (input.width() as usize, input.height() as usize);
    let (pixels, channels) = if input.color().has_alpha() {
        (input.to_rgba8().into_raw(), 4)
    } else {
        (input.to_rgb8().into_raw(), 3)
    };

    let (ow, oh) = (w * scale, h * scale);
    let mut out = vec![0u8; ow * oh * channels];
    {
        let host_in = HostImage::new(&pixels, w, h, channels)?;
        let mut host_out = HostImageMut::new(&mut out, ow, oh, channels)?;
        session.process(&host_in, &mut host_out)?;
    }

    let (ow, oh) = (u32::try_from(ow)?, u32::try_from(oh)?);
    let image = if channels == 4 {
        RgbaImage::from_raw(ow, oh, out).map(DynamicImage::ImageRgba8)
    } else {
        RgbImage::from_raw(ow, oh, out).map(DynamicImage::ImageRgb8)
    };
    match image {
        Some(image) => Ok(image),
        None => bail!("output buffer does not match {ow}x{oh}"),
    }
}

#[derive(Debug, Serialize)]
struct DeviceReport {
    ordinal: u32,
    name: String,
    heap_budget_mb: u64,
    auto_tile_size: usize,
}

fn device_reports(registry: &DeviceRegistry) -> Vec<DeviceReport> {
    registry
        .devices()
        .map(|info| DeviceReport {
            ordinal: info.ordinal,
            name: info.name.clone(),
            heap_budget_mb: info.heap_budget_mb,
            auto_tile_size: auto_tile_size(info.heap_budget_mb),
        })
        .collect()
}

fn run_devices(config: &AppConfig, json: bool) -> Result<()> {
    let registry = DeviceRegistry::initialize(config.devices.device_list())?;
    let reports = device_reports(&registry);
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("{} device(s)", registry.gpu_count());
        for report in &reports {
            println!(
                "  [{}] {}: heap budget {} MB, auto tile {}",
                report.ordinal, report.name, report.heap_budget_mb, report.auto_tile_size
            );
        }
    }
    registry.shutdown()?;
    Ok(())
}
