//! cdss-ai - developer driver for the inference subsystem
//!
//! Submits one inference job against a running backend, follows it to a
//! terminal state over push and poll, and prints the final job plus a
//! visualization summary as JSON.
//!
//! ```text
//! cdss-ai --model M1 --input ocs_id=42
//! cdss-ai --model fusion --input mri_ocs_id=7 --input gene_ocs_id=9 --no-push
//! ```

use anyhow::{bail, Context, Result};
use cdss_ai::client::{PushChannelListener, SubmitMode};
use cdss_ai::config::{ClientSettings, Overrides};
use cdss_ai::models::{InputRefs, JobState, ModelType, VisualizationState};
use cdss_ai::InferenceOrchestrator;
use cdss_common::config::{load_toml_config, resolve_config_path, LoggingConfig};
use cdss_common::events::PushHub;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PUSH_HUB_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "cdss-ai")]
#[command(about = "Submit an AI inference job and follow it to completion")]
#[command(version)]
struct Args {
    /// Model: M1 / single_modality, MG / gene_expression, MM / multi_modal
    #[arg(short, long, value_parser = parse_model)]
    model: ModelType,

    /// Input slot as slot=id (repeatable)
    #[arg(short, long = "input", value_parser = parse_input)]
    inputs: Vec<(String, Value)>,

    /// API base URL (overrides CDSS_API_BASE_URL and the config file)
    #[arg(long, env = "CDSS_API_BASE_URL")]
    base_url: Option<String>,

    /// Config file path (overrides CDSS_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll only, do not open the push channel
    #[arg(long)]
    no_push: bool,

    /// Mark the submission as automatically triggered
    #[arg(long)]
    auto: bool,
}

fn parse_model(value: &str) -> Result<ModelType, String> {
    ModelType::parse(value).ok_or_else(|| format!("unknown model '{}'", value))
}

/// `slot=id`; numeric ids are sent as numbers
fn parse_input(value: &str) -> Result<(String, Value), String> {
    let (slot, id) = value
        .split_once('=')
        .ok_or_else(|| format!("expected slot=id, got '{}'", value))?;
    let (slot, id) = (slot.trim(), id.trim());
    if slot.is_empty() || id.is_empty() {
        return Err(format!("expected slot=id, got '{}'", value));
    }
    let id = id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id));
    Ok((slot.to_string(), id))
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn visualization_summary(state: &VisualizationState) -> Value {
    match state {
        VisualizationState::NotApplicable => json!({ "status": "not_applicable" }),
        VisualizationState::Unavailable(reason) => {
            json!({ "status": "unavailable", "reason": reason })
        }
        VisualizationState::Ready(volume) => {
            let channels: serde_json::Map<String, Value> = volume
                .channels
                .iter()
                .map(|(name, channel)| {
                    let summary = if volume.label_channels.contains(name) {
                        json!({ "labels": channel.distinct_labels() })
                    } else {
                        json!({ "elements": channel.flatten().len() })
                    };
                    (name.clone(), summary)
                })
                .collect();
            json!({
                "status": "ready",
                "shape": volume.shape,
                "channels": channels,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), "cdss-ai");
    let toml_config = match &config_path {
        Some(path) => load_toml_config(path)?,
        None => Default::default(),
    };

    init_tracing(&toml_config.logging)?;
    info!(
        "Starting CDSS inference client (cdss-ai) v{}",
        env!("CARGO_PKG_VERSION")
    );
    if let Some(path) = &config_path {
        info!("Config file: {}", path.display());
    }

    let overrides = Overrides {
        base_url: args.base_url.clone(),
        disable_push: args.no_push,
        mode: Some(if args.auto {
            SubmitMode::Auto
        } else {
            SubmitMode::Manual
        }),
    };
    let settings = ClientSettings::resolve(&toml_config, &overrides);

    let mut input_refs = InputRefs::new();
    for (slot, id) in args.inputs {
        input_refs.insert(slot, id);
    }

    let api = Arc::new(settings.http_api()?);
    let shutdown = CancellationToken::new();
    let push_hub = PushHub::new(PUSH_HUB_CAPACITY);

    let listener = if settings.push.enabled {
        let listener = PushChannelListener::new(
            &settings.base_url,
            settings.token.clone(),
            push_hub.clone(),
            &settings.push,
        )?;
        Some(listener.spawn(shutdown.child_token()))
    } else {
        info!("Push channel disabled, polling only");
        None
    };

    let mut orchestrator =
        InferenceOrchestrator::with_settings(api, args.model, settings.orchestrator.clone())
            .with_parent_token(&shutdown);
    if settings.push.enabled {
        orchestrator = orchestrator.with_push_hub(push_hub);
    }

    let job = tokio::select! {
        job = orchestrator.submit(input_refs) => job?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning job");
            shutdown.cancel();
            bail!("interrupted");
        }
    };

    let output = json!({
        "job": job,
        "retry": job.retry_action(),
        "visualization": visualization_summary(&orchestrator.visualization()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    orchestrator.close();
    shutdown.cancel();
    if let Some(handle) = listener {
        if let Err(e) = handle.await {
            warn!("Push listener task failed: {}", e);
        }
    }

    if job.state != JobState::Completed {
        bail!(
            "inference job ended in state {:?}{}",
            job.state,
            job.error_message
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        );
    }
    Ok(())
}
