use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use picshare_storage::{InMemoryStore, PersistentStore, Storage};
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod schemas;
pub mod state;

use config::Config;
use state::AppState;

fn init_tracing() {
    if let Ok(endpoint) = std::env::var("OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .ok();
        if let Some(tracer) = tracer {
            let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
            let subscriber = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(telemetry);
            tracing::subscriber::set_global_default(subscriber).ok();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

pub async fn run() -> Result<()> {
    init_tracing();
    let config = Config::load();

    let store: Arc<dyn Storage> = match &config.data_dir {
        Some(dir) => match PersistentStore::open(dir.into()) {
            Ok(store) => {
                info!(data_dir = %dir, "journal-backed store ready");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!("persistent open failed: {e}; falling back to memory");
                Arc::new(InMemoryStore::new())
            }
        },
        None => Arc::new(InMemoryStore::new()),
    };

    let state = AppState {
        store,
        auth: config.auth.clone(),
    };
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("http listening on {}", addr);
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read(cert_path)?;
            let key = std::fs::read(key_path)?;
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem(cert, key).await?;
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await?;
        }
    }
    Ok(())
}
