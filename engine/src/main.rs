use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use relay_completion::HttpCompletionClient;
use relay_executor::{EngineConfig, RunExecutor, RunQueue};
use relay_observability::{init_process_logging, ProcessKind};
use relay_ranker::{HttpRanker, ModelRouter, Ranker, RankerConfig};
use relay_server::{serve, AppState};
use relay_store::{ArtifactStore, RunStore};
use relay_types::{BudgetTier, CreateRunRequest, RunMode};

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "Model-routing orchestrator for LLM workloads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP engine: run queue, executor and ranking service.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3700)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Execute one task to completion and print the merged output.
    Run {
        task: String,
        #[arg(long, default_value = "single")]
        mode: String,
        #[arg(long, default_value = "medium")]
        budget: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Force a catalog refresh and print the per-source report.
    Refresh {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

struct Engine {
    state: AppState,
    ranker: Arc<Ranker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _guard = init_process_logging(
                ProcessKind::Engine,
                &relay_observability::canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let engine = build_engine(&state_dir).await?;
            spawn_refresh_loop(engine.ranker.clone());
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            tracing::info!(state_dir = %state_dir.display(), "engine state directory");
            serve(addr, engine.state).await?;
        }
        Command::Run {
            task,
            mode,
            budget,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _guard = init_process_logging(
                ProcessKind::Cli,
                &relay_observability::canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let engine = build_engine(&state_dir).await?;
            let output = run_oneshot(&engine, &task, &mode, &budget).await?;
            println!("{output}");
        }
        Command::Refresh { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let _guard = init_process_logging(
                ProcessKind::Cli,
                &relay_observability::canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let engine = build_engine(&state_dir).await?;
            let report = engine.ranker.refresh().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Initialization order matters: config, then stores, then the artifact
/// root, then the ranker snapshot, then the queue. The background refresh
/// comes last so a cold start never blocks on feeds.
async fn build_engine(state_dir: &PathBuf) -> anyhow::Result<Engine> {
    let config = EngineConfig::from_env();

    let store = Arc::new(RunStore::new(state_dir.join("store")).await?);
    let artifacts = Arc::new(ArtifactStore::new(state_dir.join("artifacts")).await?);

    let ranker = Arc::new(Ranker::load(state_dir.join("ranker"), ranker_config()).await?);

    let completion_url = std::env::var("RELAY_COMPLETION_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string());
    let completion_key = std::env::var("RELAY_COMPLETION_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let completion_configured = completion_key.is_some();
    if !completion_configured {
        tracing::warn!("RELAY_COMPLETION_KEY is not set; completion calls will be rejected");
    }
    let completion = Arc::new(HttpCompletionClient::new(completion_url, completion_key));

    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        artifacts.clone(),
        completion,
        config.clone(),
    ));
    // Two-tier deployments plan against a remote ranking service; the default
    // is the in-process ranker.
    let router: Arc<dyn ModelRouter> = match std::env::var("RELAY_RANKING_URL") {
        Ok(url) if !url.trim().is_empty() => {
            tracing::info!(url = %url, "planning against remote ranking service");
            Arc::new(HttpRanker::new(url))
        }
        _ => ranker.clone(),
    };
    let queue = RunQueue::new(store.clone(), artifacts.clone(), router, executor, config);
    queue.clone().spawn();

    Ok(Engine {
        state: AppState {
            store,
            artifacts,
            queue,
            ranker: ranker.clone(),
            completion_configured,
        },
        ranker,
    })
}

fn ranker_config() -> RankerConfig {
    let mut config = RankerConfig::default();
    if let Ok(path) = std::env::var("RELAY_OVERRIDES_PATH") {
        if !path.trim().is_empty() {
            config.overrides_path = Some(PathBuf::from(path));
        }
    }
    config
}

fn spawn_refresh_loop(ranker: Arc<Ranker>) {
    tokio::spawn(async move {
        let interval = ranker.refresh_interval();
        loop {
            match ranker.refresh().await {
                Ok(report) => tracing::info!(models = report.models, "catalog refreshed"),
                Err(err) => tracing::warn!("catalog refresh failed: {err}"),
            }
            tokio::time::sleep(interval).await;
        }
    });
}

async fn run_oneshot(
    engine: &Engine,
    task: &str,
    mode: &str,
    budget: &str,
) -> anyhow::Result<String> {
    let mode = RunMode::parse(mode).context("unknown mode")?;
    let budget = BudgetTier::parse(budget).context("unknown budget tier")?;
    let run = engine
        .state
        .queue
        .create_run(&CreateRunRequest {
            task: task.to_string(),
            mode,
            budget: Some(budget),
            context: None,
            collective_count: None,
            role: None,
            merge: None,
        })
        .await?;

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(current) = engine.state.store.get_run(&run.id).await else {
            anyhow::bail!("run {} disappeared from the store", run.id);
        };
        if !current.status.is_terminal() {
            continue;
        }
        if let Some(error) = current.error {
            anyhow::bail!("run {} ended {}: {error}", run.id, current.status.as_str());
        }
        let merged = engine
            .state
            .artifacts
            .read_latest(&run.id, "merged")
            .await?
            .map(|(_, body)| body)
            .unwrap_or_default();
        return Ok(merged);
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("RELAY_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".relay"))
        .unwrap_or_else(|| PathBuf::from(".relay"))
}
