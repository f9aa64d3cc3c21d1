use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use multigen::anthropic::AnthropicClient;
use multigen::cli::{Cli, Command, RunArgs};
use multigen::config::MultigenConfig;
use multigen::dispatcher::{DispatchSettings, Dispatcher};
use multigen::extractor::{FINDING_SCHEMA, RecordSchema, extract_with};
use multigen::invoker::{DryRunInvoker, ModelInvoker};
use multigen::logging::init_logging;
use multigen::orchestrator::{Orchestrator, PipelineEvent, RunRequest, RunSettings};
use multigen::output::{OutputLayout, write_outputs};
use multigen::state_machine::RunReport;
use multigen::store::{JobStore, MemoryStore};
use multigen::task::SourceInput;
use multigen::ui::{RunProgress, print_extraction};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => MultigenConfig::load_from(path)?,
        None => MultigenConfig::load()?,
    };

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Extract { file, findings } => extract(file.as_deref(), findings),
        Command::Models => {
            list_models(&config);
            Ok(())
        }
    }
}

async fn run(mut config: MultigenConfig, args: RunArgs) -> Result<()> {
    if let Some(mode) = args.proofread {
        config.proofread = mode.into();
    }

    let source = SourceInput::from_path(&args.source)
        .with_context(|| format!("failed to load {}", args.source.display()))?;
    let parent_id = args
        .parent
        .clone()
        .unwrap_or_else(|| parent_from(&args.source));
    let model_id = args
        .model
        .clone()
        .unwrap_or_else(|| config.default_model.clone());

    let invoker: Arc<dyn ModelInvoker> = if config.api_key.is_empty() {
        warn!("no API key configured, using the dry-run invoker");
        Arc::new(DryRunInvoker)
    } else {
        Arc::new(AnthropicClient::new(config.api_key.clone())?)
    };
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        invoker,
        config.registry(),
        DispatchSettings {
            empty_findings: config.empty_findings,
            proofread_rules: config.proofread_rules.clone(),
        },
    ));
    let orchestrator = Orchestrator::new(dispatcher, RunSettings::from(&config));

    let mut handle = orchestrator.run(RunRequest {
        parent_id,
        targets: args.targets.clone(),
        model_id,
        source,
    })?;
    let progress = RunProgress::start(&args.targets);
    let mut retries_left: HashMap<String, u32> = args
        .targets
        .iter()
        .map(|t| (t.clone(), args.retries))
        .collect();

    while let Some(event) = handle.next_event().await {
        progress.handle(&event);
        let PipelineEvent::Settled { report } = event else {
            continue;
        };

        let mut retried = false;
        for target in retryable(&report) {
            let Some(left) = retries_left.get_mut(&target).filter(|n| **n > 0) else {
                continue;
            };
            *left -= 1;
            match handle.retry(&target).await {
                Ok(()) => retried = true,
                Err(e) => warn!(target = %target, error = %e, "retry rejected"),
            }
        }
        if !retried {
            break;
        }
    }

    let report = handle.finish().await?;
    progress.print_report(&report, args.json);

    if let Some(dir) = &args.out {
        let layout = OutputLayout::for_source(dir, &args.source);
        let written = write_outputs(store.as_ref(), &report, &layout).await?;
        info!(files = written.len(), dir = %dir.display(), "outputs written");
    }

    if !report.all_completed() {
        let incomplete = report.targets.iter().filter(|t| !t.is_completed()).count();
        bail!(
            "{incomplete} of {} targets did not complete",
            report.targets.len()
        );
    }
    Ok(())
}

/// Targets whose furthest stage ended failed, stalled or cancelled.
fn retryable(report: &RunReport) -> Vec<String> {
    report
        .targets
        .iter()
        .filter(|t| {
            t.stage(t.current_stage())
                .is_some_and(|audit| audit.phase.is_retryable())
        })
        .map(|t| t.target.clone())
        .collect()
}

fn parent_from(source: &Path) -> String {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string()
}

fn extract(file: Option<&Path>, findings: bool) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let schema = if findings {
        FINDING_SCHEMA
    } else {
        RecordSchema::ANY
    };
    let extraction = extract_with(&raw, &schema);
    print_extraction(&extraction)?;
    if !extraction.is_recognized() {
        bail!("no JSON records could be decoded");
    }
    Ok(())
}

fn list_models(config: &MultigenConfig) {
    for model in config.registry().entries() {
        let marker = if model.id == config.default_model {
            "*"
        } else {
            " "
        };
        let state = if model.enabled { "" } else { " (disabled)" };
        println!(
            "{marker} {:<10} {:<32} max_tokens={}{state}",
            model.id, model.provider_model, model.max_tokens
        );
    }
}
