use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Runtime;
use uuid::Uuid;
use veracity_verification::{
    CancellationToken, Claim, FactCheckReport, VeracityConfig, VerificationRuntime,
};

#[derive(Parser, Debug)]
#[command(name = "veracity", version, about = "Claim verification engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verifies a batch of claims and prints the report.
    Check(CheckArgs),
    /// Validates a configuration file and prints the effective settings.
    Config {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// JSON array of `{"id", "text"}` objects or plain strings.
    #[arg(long)]
    claims: PathBuf,
    #[arg(long, required_unless_present = "offline")]
    config: Option<PathBuf>,
    /// Loopback search with the offline adjudicator.
    #[arg(long, conflicts_with = "config")]
    offline: bool,
    /// Corpus searched in offline mode.
    #[arg(long, requires = "offline")]
    corpus: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Also writes the JSON report here.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClaimInput {
    Text(String),
    Record {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check(args) => handle_check(args),
        Commands::Config { config } => {
            let config = VeracityConfig::load(&config)?;
            let trusted = config.trusted_domains()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            eprintln!("configuration valid; {} trusted domains", trusted.len());
            Ok(())
        }
    }
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let claims = read_claims(&args.claims)?;
    let mut config = match (&args.config, args.offline) {
        (Some(path), _) => VeracityConfig::load(path)?,
        (None, true) => VeracityConfig::offline_with_corpus(args.corpus.clone()),
        (None, false) => bail!("pass --config or --offline"),
    };
    if let Some(path) = &args.event_log {
        config.telemetry.event_log = Some(path.clone());
    }
    if let Some(path) = &args.log {
        config.telemetry.log_path = Some(path.clone());
    }

    let run_id = format!("run-{}", Uuid::new_v4());
    let event_log = config.telemetry.event_log.clone();
    let log_path = config.telemetry.log_path.clone();
    let runtime = Runtime::new()?;

    log_run_event(
        log_path.as_deref(),
        LogLevel::Info,
        "check started",
        json!({ "run_id": run_id, "claims": claims.len() }),
    )?;
    let report = runtime.block_on(async {
        publish_run_event(
            event_log.as_deref(),
            "veracity.run_started",
            &run_id,
            json!({ "claims": claims.len() }),
        )
        .await?;
        let engine = VerificationRuntime::from_config(config)?;
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received; cancelling outstanding claims");
                watcher.cancel();
            }
        });
        let report = engine.verify_with_cancel(&claims, &cancel).await;
        interrupt.abort();
        publish_run_event(
            event_log.as_deref(),
            "veracity.run_completed",
            &run_id,
            json!({
                "overall_verdict": report.overall_verdict,
                "confidence": report.overall_confidence,
                "cancelled": cancel.is_cancelled(),
            }),
        )
        .await?;
        anyhow::Ok(report)
    })?;
    let degraded = report.verdicts.iter().filter(|v| v.degraded).count();
    log_run_event(
        log_path.as_deref(),
        LogLevel::Info,
        "check completed",
        json!({
            "run_id": run_id,
            "overall_verdict": report.overall_verdict,
            "degraded": degraded,
        }),
    )?;

    if let Some(path) = &args.output {
        write_report(path, &report)?;
    }
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!("{}", render_claims(&report)),
    }
    Ok(())
}

fn read_claims(path: &Path) -> Result<Vec<Claim>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading claims {}", path.display()))?;
    let inputs: Vec<ClaimInput> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing claims {}", path.display()))?;
    parse_claims(inputs)
}

fn parse_claims(inputs: Vec<ClaimInput>) -> Result<Vec<Claim>> {
    let mut seen = HashSet::new();
    let mut claims = Vec::with_capacity(inputs.len());
    for (idx, input) in inputs.into_iter().enumerate() {
        let (id, text) = match input {
            ClaimInput::Text(text) => (None, text),
            ClaimInput::Record { id, text } => (id, text),
        };
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("claim-{}", idx + 1));
        if !seen.insert(id.clone()) {
            bail!("duplicate claim id {id}");
        }
        claims.push(Claim::new(id, text));
    }
    Ok(claims)
}

fn render_claims(report: &FactCheckReport) -> String {
    let mut out = report.render_text();
    out.push_str("\n\nClaims:");
    for verdict in &report.verdicts {
        out.push_str(&format!(
            "\n- [{} {}%{}] {}",
            verdict.result,
            verdict.confidence,
            if verdict.degraded { ", degraded" } else { "" },
            verdict.claim_text
        ));
        for url in verdict.cited_urls() {
            out.push_str(&format!("\n    {url}"));
        }
    }
    out
}

fn write_report(path: &Path, report: &FactCheckReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(report)?;
    fs::write(path, data).with_context(|| format!("writing report {}", path.display()))
}

async fn publish_run_event(
    path: Option<&Path>,
    event_type: &str,
    run_id: &str,
    payload: Value,
) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let payload = match payload {
        Value::Object(mut map) => {
            map.insert("run_id".into(), Value::String(run_id.to_string()));
            Value::Object(map)
        }
        other => json!({ "run_id": run_id, "data": other }),
    };
    let publisher = FileEventPublisher::new(path)?;
    publisher
        .publish(EventRecord::new("veracity", event_type, payload))
        .await
}

fn log_run_event(path: Option<&Path>, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let logger = JsonLogger::new(path)?;
    logger.log(&LogRecord::new("veracity", level, message).with_metadata(metadata))
}
