//! Prompter server: JSON API for repository-scoped AI conversations.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use prompter::io::config::load_config;
use prompter::io::paths;
use prompter::{Collaborators, Prompter};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "prompter-server")]
#[command(about = "Turn conversations about a repository into published prompts")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Config file (defaults to ~/.prompter/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the conversation store (overrides the config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory containing UI static files
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    prompter::logging::init("prompter_server=info,prompter=info");

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => paths::default_config_path()?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    info!(config = %config_path.display(), "starting prompter-server");

    let collaborators = Collaborators::from_config(&config)?;
    let state = AppState::new(Prompter::new(config, collaborators));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", routes::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    match args.ui_dir {
        Some(ui_dir) if ui_dir.exists() => {
            info!(ui_dir = %ui_dir.display(), "serving static UI files");
            app = app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
        }
        Some(ui_dir) => {
            info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
        }
        None => {}
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(err = %err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
