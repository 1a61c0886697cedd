//! Three-stage research pipeline (research, analysis, writer) run in-process.
//!
//! ```text
//! research-pipeline [-c pipeline.toml] [--serve] [query...]
//! ```
//!
//! Without `[model]` credentials every stage runs on a scripted model, so the
//! demo works offline. With `--serve` the coordinator is exposed on
//! `server.host:server.port` instead of running one query.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use agent_pipeline::server::{agent_router, coordinator_router, serve};
use agent_pipeline::telemetry::init_tracing;
use agent_pipeline::{
    basic_toolkit, model_from_config, AgentRuntime, AppConfig, LanguageModel, PipelineError,
    RemoteAgentClient, Result, StubModel, WorkflowCoordinator, WorkflowInput,
};
use clap::Parser;
use serde_json::json;

const STAGES: [(&str, &str); 3] = [
    (
        "research",
        "You are a research agent. Gather facts relevant to the query using the tools available.",
    ),
    (
        "analysis",
        "You are an analysis agent. Identify themes, gaps and contradictions in the prior findings.",
    ),
    (
        "writer",
        "You are a writing agent. Produce a concise report from the prior stages.",
    ),
];

const DEFAULT_QUERY: &str = "What are the trade-offs of async runtimes in Rust?";

/// Runs a research, analysis and writer pipeline over one query.
#[derive(Parser, Debug)]
#[command(name = "research-pipeline", version, about)]
struct Cli {
    /// Config file path. Defaults plus `PIPELINE_*` env vars when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve the coordinator over HTTP instead of running one query.
    #[arg(long)]
    serve: bool,

    /// Query words, joined with spaces.
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

impl Cli {
    fn query(&self) -> String {
        if self.query.is_empty() {
            DEFAULT_QUERY.to_string()
        } else {
            self.query.join(" ")
        }
    }
}

fn scripted(stage: &str) -> Arc<dyn LanguageModel> {
    let (first, second) = match stage {
        "research" => (
            json!({
                "action": "call_tool",
                "name": "word_count",
                "arguments": { "text": "tokio async-std smol glommio" }
            }),
            json!({ "action": "respond", "content": "Four runtimes are in common use: tokio, async-std, smol and glommio." }),
        ),
        "analysis" => (
            json!({
                "action": "call_tool",
                "name": "echo",
                "arguments": { "theme": "ecosystem gravity around tokio" }
            }),
            json!({ "action": "respond", "content": "Main theme: ecosystem gravity favours tokio; io_uring runtimes trade portability for throughput." }),
        ),
        _ => (
            json!({ "action": "respond", "content": "Report: pick tokio unless a thread-per-core design is a hard requirement." }),
            json!({ "action": "respond", "content": "unused" }),
        ),
    };
    Arc::new(
        StubModel::scripted(vec![first.to_string(), second.to_string()]).with_model_id("gemini-1.5-flash"),
    )
}

fn build_runtime(cfg: &AppConfig, stage: &str, role_prompt: &str) -> Result<AgentRuntime> {
    let model = if cfg.model.api_key.is_some() {
        model_from_config(&cfg.model)?
    } else {
        scripted(stage)
    };
    let mut agent_cfg = cfg.agent.clone();
    agent_cfg.name = stage.to_string();
    agent_cfg.role_prompt = role_prompt.to_string();
    Ok(AgentRuntime::from_config(&agent_cfg, model)
        .with_tools(basic_toolkit())
        .with_pricing(&cfg.pricing_table()))
}

/// Remote stages from config when present, in-process runtimes otherwise.
fn build_coordinator(cfg: &AppConfig) -> Result<WorkflowCoordinator> {
    let mut coordinator = WorkflowCoordinator::new(cfg.workflow.name.clone());
    if !cfg.workflow.stages.is_empty() {
        for stage in &cfg.workflow.stages {
            let client = RemoteAgentClient::from_config(stage.url.clone(), &cfg.remote);
            coordinator = coordinator.with_stage(stage.name.clone(), Arc::new(client));
        }
        return Ok(coordinator);
    }
    for (stage, prompt) in STAGES {
        let runtime = build_runtime(cfg, stage, prompt)?;
        coordinator = coordinator.with_stage(stage, Arc::new(runtime));
    }
    Ok(coordinator)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppConfig::from_env_or_file(path)?,
        None => {
            let mut cfg = AppConfig::default();
            cfg.apply_env()?;
            cfg
        }
    };
    init_tracing(&cfg.logging)?;

    if cli.serve {
        let addr: SocketAddr = cfg
            .server
            .bind_address()
            .parse()
            .map_err(|err| PipelineError::Config(format!("invalid bind address: {err}")))?;
        let router = match std::env::var("PIPELINE_AGENT_STAGE") {
            // Serve a single stage so other coordinators can reach it remotely.
            Ok(stage) => {
                let prompt = STAGES
                    .iter()
                    .find(|(name, _)| *name == stage)
                    .map(|(_, prompt)| *prompt)
                    .unwrap_or(cfg.agent.role_prompt.as_str())
                    .to_string();
                agent_router(Arc::new(build_runtime(&cfg, &stage, &prompt)?))
            }
            Err(_) => coordinator_router(Arc::new(build_coordinator(&cfg)?)),
        };
        return serve(router, addr).await;
    }

    let coordinator = build_coordinator(&cfg)?;
    let result = coordinator.execute(WorkflowInput::new(cli.query())).await?;
    tracing::info!(
        correlation_id = %result.correlation_id,
        stages = result.stages.len(),
        total_tokens = result.token_usage.total_tokens,
        "workflow complete"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
