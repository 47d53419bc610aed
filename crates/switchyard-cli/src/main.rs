mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::SwitchyardConfig;
use std::path::PathBuf;
use switchyard_core::{HandlerType, Request};
use switchyard_recovery::{FailureInfo, FailureTracker};
use switchyard_routing::{IntentClassifier, RoutingEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: request routing and failure analysis")]
struct Cli {
    /// Path to config file (defaults to ./switchyard.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a request and print the classification
    Classify {
        prompt: String,
        /// File path the request refers to
        #[arg(short, long)]
        file: Option<String>,
        /// Read code content from this file
        #[arg(long)]
        code: Option<PathBuf>,
    },
    /// Route a request against the configured handlers
    Route {
        prompt: String,
        #[arg(short, long)]
        file: Option<String>,
        #[arg(long)]
        code: Option<PathBuf>,
        /// Preferred handler type (e.g. fixer, csharp)
        #[arg(long)]
        prefer: Option<HandlerType>,
    },
    /// List routing rules in evaluation order
    Rules,
    /// Suggest recovery strategies for a failure message
    Suggest {
        message: String,
        #[arg(long, default_value = "unknown")]
        component: String,
    },
    /// Diagnose a failure message against the failure snapshot
    Diagnose {
        message: String,
        #[arg(long, default_value = "unknown")]
        component: String,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_request(
    prompt: String,
    file: Option<String>,
    code: Option<PathBuf>,
) -> anyhow::Result<Request> {
    let mut request = Request::new(prompt);
    if let Some(file) = file {
        request = request.with_file_path(file);
    }
    if let Some(path) = code {
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read code file '{}': {}", path.display(), e)
        })?;
        request = request.with_code(content);
    }
    Ok(request)
}

/// A tracker seeded from the configured snapshot, if it exists.
async fn load_tracker(config: &SwitchyardConfig) -> anyhow::Result<FailureTracker> {
    let tracker = FailureTracker::new(config.tracker.clone());
    if let Some(path) = &config.tracker.snapshot_path {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let restored = tracker.load_snapshot(path).await?;
            info!(path = %path.display(), patterns = restored, "Failure history loaded");
        }
    }
    Ok(tracker)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = SwitchyardConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Classify { prompt, file, code } => {
            let request = build_request(prompt, file, code).await?;
            print_json(&IntentClassifier::new().classify(&request))?;
        }
        Commands::Route {
            prompt,
            file,
            code,
            prefer,
        } => {
            let mut request = build_request(prompt, file, code).await?;
            if let Some(handler_type) = prefer {
                request = request.with_preferred_handler(handler_type);
            }
            let descriptors = config.descriptors();
            if descriptors.is_empty() {
                anyhow::bail!("No handlers configured; add [[handlers]] entries to the config");
            }
            let engine = RoutingEngine::new(config.routing.clone())?;
            let classification = IntentClassifier::new().classify(&request);
            let decision =
                engine.route(&classification, &descriptors, request.preferred_handler)?;
            print_json(&serde_json::json!({
                "classification": classification,
                "decision": decision,
            }))?;
        }
        Commands::Rules => {
            let engine = RoutingEngine::new(config.routing.clone())?;
            for rule in engine.rules() {
                let target = rule
                    .target_handler
                    .clone()
                    .or_else(|| rule.target_type.map(|t| t.to_string()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5}  {:<28} -> {:<16} boost {:.2}{}",
                    rule.priority,
                    rule.name,
                    target,
                    rule.confidence_boost,
                    if rule.enabled { "" } else { "  (disabled)" }
                );
            }
        }
        Commands::Suggest { message, component } => {
            let tracker = FailureTracker::new(config.tracker.clone());
            let info = FailureInfo::new(message, component);
            print_json(&serde_json::json!({
                "category": info.category(),
                "severity": info.severity(),
                "strategies": tracker.suggest_recovery(&info),
            }))?;
        }
        Commands::Diagnose { message, component } => {
            let tracker = load_tracker(&config).await?;
            print_json(&tracker.diagnose(&FailureInfo::new(message, component)))?;
        }
        Commands::Config => print_json(&config)?,
    }

    Ok(())
}
