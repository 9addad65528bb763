use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use tempra_core::capture::{write_plane, write_ppm_preview, CaptureManifest};
use tempra_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use tempra_core::driver::UpscalerDriver;
use tempra_core::engine::build_default_registry;
use tempra_core::logging::{self, DEFAULT_LOG_FILTER};
use tempra_core::model::{sha256_file, ModelCatalog};
use tempra_core::types::FrameInputs;

#[derive(Parser)]
#[command(name = "tempra", about = "Neural temporal super-sampling upscaler")]
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

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Config file path (default: <data-dir>/config.toml)"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a captured frame sequence through the upscaler
    Replay(ReplayArgs),
    /// Show catalog entries and on-disk status for models
    InspectModel(InspectModelArgs),
    /// List the registered inference engines
    Engines,
}

#[derive(Args)]
struct ReplayArgs {
    #[arg(help = "Capture directory (absolute, or relative to the captures dir)")]
    capture: PathBuf,
    #[arg(short = 'o', long, help = "Directory for upscaled planes and previews")]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = 1, help = "Replay the capture on this many views")]
    views: u64,
    #[arg(long, help = "Limit the replay to the first N frames")]
    frames: Option<usize>,
    #[arg(long, help = "Override the configured inference engine")]
    engine: Option<String>,
    #[arg(long, help = "Override the configured model")]
    model: Option<String>,
    #[arg(long, help = "Override the configured debug visualizer level")]
    debug_level: Option<u8>,
    #[arg(long, help = "Run every frame without temporal history")]
    no_history: bool,
}

#[derive(Args)]
struct InspectModelArgs {
    #[arg(help = "Model name; omit to list the whole catalog")]
    model: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = tempra_core::runtime::setup_runtime_libs();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    runtime_report.log();
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }

    let config = load_config(&resolved_data_dir, cli.config.as_deref());

    match cli.command {
        Commands::Replay(args) => run_replay(args, config, resolved_data_dir).await,
        Commands::InspectModel(args) => inspect_model(args, &config, &resolved_data_dir),
        Commands::Engines => list_engines(),
    }
}

fn load_config(data_dir: &Path, config_override: Option<&Path>) -> AppConfig {
    let cfg_path = config_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_path(data_dir));
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);

    let rust_log = std::env::var("RUST_LOG").ok();
    let directives = logging::resolve_log_filter(cli_log_filter, verbose, rust_log.as_deref())
        .effective();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&directives, "console"));

    let sink_error = match logging::open_log_file_sink(data_dir, logging::DEFAULT_LOG_RETENTION)
    {
        Ok(sink) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(sink.writer)
                .with_filter(parse_env_filter_with_fallback(&directives, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to install the tracing subscriber: {error}.");
                return;
            }
            None
        }
        Err(error) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to install the tracing subscriber: {error}.");
                return;
            }
            Some(error)
        }
    };

    if let Some(error) = sink_error {
        warn!(
            error = format!("{error:#}"),
            "File logging unavailable; continuing with console output only"
        );
    }
    match crash_hook {
        Ok(crash_dir) => debug!(dir = %crash_dir.display(), "Panic crash artifacts enabled"),
        Err(error) => warn!(
            error = format!("{error:#}"),
            "Panic crash artifacts unavailable; panics will only reach stderr"
        ),
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

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn build_driver(config: &AppConfig, data_dir: &Path) -> Result<UpscalerDriver> {
    let registry = build_default_registry();
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let catalog = ModelCatalog::with_builtin(models_dir)?;
    Ok(UpscalerDriver::new(
        config.upscaler.clone(),
        registry,
        catalog,
    ))
}

fn resolve_capture_dir(config: &AppConfig, data_dir: &Path, capture: &Path) -> PathBuf {
    if capture.is_dir() {
        return capture.to_path_buf();
    }
    let captures_root = resolve_relative_to(data_dir, &config.paths.captures_dir);
    resolve_relative_to(&captures_root, capture)
}

async fn run_replay(args: ReplayArgs, mut config: AppConfig, data_dir: PathBuf) -> Result<()> {
    if let Some(engine) = args.engine {
        config.upscaler.engine = engine;
    }
    if let Some(model) = args.model {
        config.upscaler.model = model;
    }
    if let Some(level) = args.debug_level {
        config.upscaler.debug_level = level;
    }
    if args.views == 0 {
        bail!("--views must be at least 1");
    }

    let capture_dir = resolve_capture_dir(&config, &data_dir, &args.capture);
    let manifest = CaptureManifest::load(&capture_dir)?;
    let frame_count = args
        .frames
        .map(|limit| limit.min(manifest.frames.len()))
        .unwrap_or(manifest.frames.len());
    if frame_count == 0 {
        bail!("capture '{}' has no frames to replay", manifest.name);
    }

    info!(
        capture = %manifest.name,
        frames = frame_count,
        views = args.views,
        input = ?manifest.input_extent,
        output = ?manifest.output_extent,
        "Loading capture"
    );
    let mut frames: Vec<FrameInputs> = Vec::with_capacity(frame_count);
    for index in 0..frame_count {
        frames.push(manifest.frame_inputs(&capture_dir, index)?);
    }

    let driver = Arc::new(build_driver(&config, &data_dir)?);
    driver.load_model().context("load configured model")?;
    if args.no_history {
        driver.set_history_enabled(false);
    }

    let sequences: Vec<(u64, Vec<FrameInputs>)> = (0..args.views)
        .map(|view_id| (view_id, frames.clone()))
        .collect();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping replay at the next frame boundary");
            let _ = cancel_tx.send(true);
        }
    });

    let start = Instant::now();
    let results = driver.run_views(sequences, cancel_rx).await?;
    let elapsed = start.elapsed().as_secs_f64();
    let total_frames: usize = results.iter().map(|(_, outcomes)| outcomes.len()).sum();
    info!(
        views = results.len(),
        frames = total_frames,
        elapsed_secs = format!("{elapsed:.2}"),
        "Replay finished"
    );

    if let Some(out_dir) = args.output {
        write_outputs(&out_dir, &results)?;
    }

    Ok(())
}

fn write_outputs(
    out_dir: &Path,
    results: &[(u64, Vec<tempra_core::upscaler::UpscaleOutcome>)],
) -> Result<()> {
    for (view_id, outcomes) in results {
        let view_dir = out_dir.join(format!("view{view_id:03}"));
        std::fs::create_dir_all(&view_dir)
            .with_context(|| format!("create output directory {}", view_dir.display()))?;
        for (index, outcome) in outcomes.iter().enumerate() {
            let plane_path = view_dir.join(format!("frame{index:04}.color.raw"));
            write_plane(&outcome.output, &plane_path)?;
            let preview_path = view_dir.join(format!("frame{index:04}.ppm"));
            write_ppm_preview(&outcome.output, &preview_path)?;
        }
        info!(
            view_id,
            frames = outcomes.len(),
            dir = %view_dir.display(),
            "Wrote upscaled planes and previews"
        );
    }
    Ok(())
}

fn inspect_model(args: InspectModelArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let catalog = ModelCatalog::with_builtin(models_dir)?;

    let entries: Vec<_> = match &args.model {
        Some(name) => {
            let entry = catalog
                .get(name)
                .with_context(|| format!("model '{name}' is not in the catalog"))?;
            vec![entry.clone()]
        }
        None => catalog.entries().to_vec(),
    };

    for entry in &entries {
        let path = catalog.model_path(entry);
        println!(
            "{}",
            serde_json::to_string_pretty(entry).context("serialize catalog entry")?
        );
        if path.is_file() {
            let digest = sha256_file(&path)?;
            println!("  file: {} (sha256 {digest})", path.display());
        } else {
            println!("  file: {} (missing)", path.display());
        }
    }
    Ok(())
}

fn list_engines() -> Result<()> {
    let registry = build_default_registry();
    for name in registry.names() {
        println!("{name}");
    }
    Ok(())
}



#[cfg(test)]
mod log_filter_tests {
    use tempra_core::logging::{resolve_log_filter, ORT_NOISE_SUPPRESSION};

    #[test]
    fn default_filter_suppresses_ort_chatter() {
        let selected = resolve_log_filter(None, 0, None).effective();
        assert_eq!(selected, format!("{ORT_NOISE_SUPPRESSION},info"));
    }

    #[test]
    fn rust_log_keeps_noise_suppression() {
        let selected = resolve_log_filter(None, 0, Some("debug")).effective();
        assert_eq!(selected, format!("{ORT_NOISE_SUPPRESSION},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log_verbatim() {
        assert_eq!(resolve_log_filter(None, 1, Some("info")).effective(), "debug");
        assert_eq!(resolve_log_filter(None, 2, Some("info")).effective(), "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = resolve_log_filter(Some("tempra_core=trace"), 2, Some("warn")).effective();
        assert_eq!(selected, "tempra_core=trace");
    }
}
