//! Pipeline server - HTTP surface for starting and reviewing runs.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use pipeline::io::config::load_config;
use pipeline::io::feedback::FileFeedbackMemory;
use pipeline::io::git::GitVcs;
use pipeline::io::reasoner::CommandReasoner;
use pipeline::io::run_store::InMemoryRunStore;
use pipeline::io::scanner::FsScanner;
use pipeline::io::tracker::HttpTracker;
use pipeline::io::verification::{VerificationEngine, VerificationSettings};
use pipeline::orchestrator::{Collaborators, Pipeline};
use pipeline::service::RunService;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "pipeline-server")]
#[command(about = "HTTP API for ticket-to-change runs with a human approval gate")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Pipeline config file (TOML); defaults apply when it is missing
    #[arg(long, default_value = "pipeline.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pipeline_server=info".parse()?)
                .add_directive("pipeline=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!(config = %args.config.display(), "starting pipeline-server");

    let collaborators = Collaborators {
        tracker: Arc::new(HttpTracker::new()?),
        scanner: Arc::new(FsScanner::new(config.scanner.clone())),
        vcs: Arc::new(GitVcs::from_env(config.git.remote.clone())),
        reasoner: Arc::new(CommandReasoner::new(config.reasoner.clone())),
        feedback: Arc::new(FileFeedbackMemory::new(config.feedback_history_cap)),
        verifier: Arc::new(VerificationEngine::new(VerificationSettings::from_config(
            &config,
        ))),
    };
    let pipeline = Pipeline::new(collaborators, &config)?;
    let service = RunService::new(
        pipeline,
        Arc::new(InMemoryRunStore::new()),
        config.default_target_branch.clone(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(AppState::new(service));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
