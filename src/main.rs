//! Natural-language-to-SQL query assistant service entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use edu_query_assistant::config::Config;
use edu_query_assistant::db;
use edu_query_assistant::error::{AppError, Result};
use edu_query_assistant::http::{self, AppState};
use edu_query_assistant::llm::{OpenAiClient, OpenAiConfig};
use edu_query_assistant::logging;
use edu_query_assistant::persistence::StateDb;
use edu_query_assistant::schema_kb::SchemaKnowledge;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    logging::init_stderr_logging();

    if let Err(e) = run().await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load(&config_path)?;

    info!("Business database: {}", config.database.display_string());

    let kb = SchemaKnowledge::load(&config.paths.schema_kb_path)?;
    let db = db::connect(&config.database).await?;

    let api_key = config
        .llm
        .api_key
        .clone()
        .ok_or_else(|| AppError::config("LLM_API_KEY is required"))?;
    let base_url = config
        .llm
        .base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    let llm = OpenAiClient::new(OpenAiConfig::new(api_key, base_url))?;

    let state_db = StateDb::open_default().await?;

    let state = Arc::new(AppState {
        auth: Arc::new(config.auth.clone()),
        kb: Arc::new(kb),
        config,
        db,
        llm: Box::new(llm),
        state_db,
    });

    let router = http::build_router(state);

    let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .map_err(|e| AppError::config(format!("invalid BIND_ADDR: {e}")))?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AppError::internal(format!("failed to bind {bind_addr}: {e}")))?;

    info!("Listening on {bind_addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::internal(format!("server error: {e}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down");
}
