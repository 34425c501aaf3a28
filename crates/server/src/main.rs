// sf-server main.rs
// Binary entrypoint: config from env/args, SQLite-backed state, ingest
// workers, axum server with graceful shutdown.

use std::path::PathBuf;

use sf_core::TimingConfig;
use sf_server::{build_router, AppState};
use sf_timingd::PipelineRunner;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sf_server=info,sf_timingd=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let port: u16 = args
        .iter()
        .position(|a| a == "--port" || a == "-p")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            std::env::var("SF_SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(8080);

    let data_dir: PathBuf = args
        .iter()
        .position(|a| a == "--data-dir" || a == "-d")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .or_else(|| std::env::var("SF_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./data"));

    let config = load_config();

    let state = match AppState::open(&data_dir, config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to open stores");
            std::process::exit(1);
        }
    };

    // One worker per log partition; serial within a partition.
    let runner = PipelineRunner::start(state.pipeline.clone(), state.event_log.clone());

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("timing layer listening at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    runner.join().await;
}

/// `SF_CONFIG` points at a JSON file overlaying `TimingConfig` defaults.
fn load_config() -> TimingConfig {
    let Some(path) = std::env::var("SF_CONFIG").ok() else {
        return TimingConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => {
                tracing::info!(path, "loaded configuration");
                config
            }
            Err(e) => {
                tracing::error!(path, error = %e, "invalid config file, using defaults");
                TimingConfig::default()
            }
        },
        Err(e) => {
            tracing::error!(path, error = %e, "unreadable config file, using defaults");
            TimingConfig::default()
        }
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down...");
}
