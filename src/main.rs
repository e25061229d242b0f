use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use attune::sim::{
    scripted_locations, Scenario, SimAssetFetcher, SimFrameSource, SimLandmarkEngine,
    SimModelRuntime, SimTelemetrySink,
};
use attune::{AttuneConfig, AttuneEngine, TelemetrySink};

#[derive(Parser, Debug)]
#[command(name = "attune")]
#[command(about = "Emotion-aware adaptation engine for learning apps")]
#[command(version)]
#[command(long_about = "Runs the full emotion inference pipeline against a scripted camera: \
detector lifecycle with primary/fallback tiers, cooperative sampling, fused heuristics, \
per-surface stabilization, and throttled telemetry. Scenarios script what the camera sees; \
the config file and ATTUNE_* environment variables tune thresholds and timing.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "attune.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Assemble the engine but do not start sampling
    #[arg(long, help = "Perform dry run - assemble the engine but don't start it")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Scripted camera scenario to run
    #[arg(short, long, default_value = "calm", help = "Camera script; see --list-scenarios")]
    scenario: String,

    /// List available scenarios and exit
    #[arg(long, help = "List built-in scenario names and exit")]
    list_scenarios: bool,

    /// Number of sampling cycles to run (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0, help = "Stop after this many sampling intervals")]
    cycles: u64,

    /// Auxiliary quiz-performance score in [0, 1] fed to the adaptation engine
    #[arg(long, value_name = "SCORE", help = "Simulated quiz performance score in [0, 1]")]
    performance: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    if args.list_scenarios {
        for name in Scenario::known_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting attune v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match AttuneConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let Some(scenario) = Scenario::named(&args.scenario) else {
        eprintln!("Unknown scenario '{}'. Available:", args.scenario);
        for name in Scenario::known_names() {
            eprintln!("  {}", name);
        }
        std::process::exit(1);
    };
    let scenario = Arc::new(scenario);
    info!("Running scenario '{}'", scenario.name());

    // The binary always runs on the scripted seams, so asset locations in the
    // config are redirected to the in-memory store. Thresholds and timing
    // still come from the config file and environment.
    scripted_locations(&mut config);
    let interval_ms = config.sampling.interval_ms;

    // Context-only scripts are invisible to the pixel classifier; refusing
    // the primary tier lets the lifecycle settle on the heuristics.
    let runtime = if scenario.needs_fallback() {
        info!("Scenario needs the heuristic tier; primary loads will be refused");
        SimModelRuntime::failing_load(Arc::clone(&scenario))
    } else {
        SimModelRuntime::new(Arc::clone(&scenario))
    };

    let sink = Arc::new(SimTelemetrySink::new());
    let engine = AttuneEngine::builder()
        .config(config)
        .frames(Arc::new(SimFrameSource::new(Arc::clone(&scenario))))
        .fetcher(Arc::new(SimAssetFetcher::new()))
        .model_runtime(Arc::new(runtime))
        .landmark_engine(Arc::new(SimLandmarkEngine::new(Arc::clone(&scenario))))
        .telemetry_sink(Arc::clone(&sink) as Arc<dyn TelemetrySink>)
        .build()
        .inspect_err(|e| error!("Failed to assemble engine: {}", e))?;

    if args.dry_run {
        info!("Dry run mode - engine assembled but not started");
        println!("✓ Dry run completed successfully - engine assembled");
        return Ok(());
    }

    if let Some(score) = args.performance {
        engine.set_performance(Some(score));
        info!("Auxiliary performance score: {:.2}", score);
    }

    let surface_id = engine.mount_surface();

    // Echo pipeline events so a plain run shows what the pipeline decides.
    let mut receiver = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => info!("{}", event.description()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    engine.start().await?;

    if args.cycles > 0 {
        let run = std::time::Duration::from_millis(args.cycles * interval_ms + interval_ms / 2);
        tokio::select! {
            _ = tokio::time::sleep(run) => info!("Scenario run complete"),
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
    }

    engine.stop().await;

    if let Some(stabilizer) = engine.stabilizer(surface_id) {
        info!(
            "Assistive surface {} ended {}",
            surface_id,
            if stabilizer.is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    info!("Telemetry records delivered: {}", sink.len());

    let status = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("attune={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Attune Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[detector]
# Backend tried on first activation: "primary" or "fallback"
preferred_backend = "primary"

[model]
# Model description file for the primary classifier
manifest_location = "./models/emotion/model.json"
# Sidecar ordered label list
labels_location = "./models/emotion/labels.json"
# Pixel normalization the model was trained with: "zero-to-one" or "neg-one-to-one"
normalization = "zero-to-one"
# Input size used when the session does not declare its dimensions
default_input_size = [224, 224]

[landmarks.face]
# Operator overrides win over the candidate lists when set
# runtime_override = "/opt/attune/landmarker/runtime"
# model_override = "/opt/attune/landmarker/face_landmarker.task"
runtime_candidates = ["./assets/landmarker/runtime", "/usr/share/attune/landmarker/runtime"]
model_candidates = ["./assets/landmarker/face_landmarker.task", "/usr/share/attune/landmarker/face_landmarker.task"]

[landmarks.hand]
runtime_candidates = ["./assets/landmarker/runtime", "/usr/share/attune/landmarker/runtime"]
model_candidates = ["./assets/landmarker/hand_landmarker.task", "/usr/share/attune/landmarker/hand_landmarker.task"]

[landmarks.pose]
runtime_candidates = ["./assets/landmarker/runtime", "/usr/share/attune/landmarker/runtime"]
model_candidates = ["./assets/landmarker/pose_landmarker.task", "/usr/share/attune/landmarker/pose_landmarker.task"]

[sampling]
# Delay between detection cycles in milliseconds
interval_ms = 1000
# Retry delay when the current frame is not yet decodable
not_ready_poll_ms = 25
# Upper bound on one backend inference call
inference_timeout_ms = 2000

[fusion]
# Below this, the fused result is Neutral at that confidence
neutral_floor = 0.35
# Positive at or above this confidence resists the contextual override
strong_positive_floor = 0.7
# Weight applied to the brow-tension signal
brow_tension_weight = 0.9
# Hand-to-cheek distance band as a fraction of face width
cheek_distance_start = 0.42
cheek_distance_full = 0.15
cheek_score_threshold = 0.5
# Looser band for the wrist substitute signal
pose_distance_start = 0.6
pose_distance_full = 0.25
pose_score_threshold = 0.6

[adaptation]
# Negative confidence at or above this means the learner is struggling
struggling_threshold = 0.6
# Positive confidence at or above this means the learner is engaged
engaged_threshold = 0.6
# Negative confidence at or above this (but below struggling) shows encouragement
encouragement_floor = 0.4
# Performance score below this corroborates a struggling read
low_performance_floor = 0.4
# How much a low performance score relaxes the struggling threshold
performance_assist_margin = 0.1

[stabilizer]
# Recommendation must persist this long before a mode turns on
activation_delay_ms = 4000
# Once on, a mode is held at least this long
min_hold_ms = 60000
# Extra delay appended after the hold expires
deactivation_delay_ms = 6000

[telemetry]
# Master switch for emotion telemetry
enabled = true
# Minimum spacing between emissions per learner
min_interval_ms = 5000
# Confidence floor for samples from the primary classifier
primary_confidence_floor = 0.35
# Confidence floor for samples from the fallback heuristic
fallback_confidence_floor = 0.2

[system]
# Broadcast bus capacity
event_bus_capacity = 100
# Lifecycle transitions kept for diagnostics
transition_history = 32
"#;

    println!("{}", default_config);
}
