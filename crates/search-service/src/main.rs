use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use search_service::api::{self, AppState};
use search_service::{MctsService, SessionService, Settings, TaskService};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting PrismBench search service");

    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "configs".to_string());
    let settings = Arc::new(Settings::load(&config_dir)?);

    let sessions = Arc::new(SessionService::new(Arc::clone(&settings)));
    let mcts = Arc::new(MctsService::new(Arc::clone(&settings)));
    let tasks = Arc::new(TaskService::new(
        Arc::clone(&sessions),
        mcts,
        Arc::clone(&settings),
    ));

    let app = api::router(AppState { sessions, tasks });

    let port: u16 = env::var("SEARCH_SERVICE_PORT")
        .or_else(|_| env::var("PORT"))
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("search service listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
