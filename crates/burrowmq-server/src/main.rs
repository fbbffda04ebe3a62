use burrowmq_server::tenant::TenantDirectory;
use burrowmq_server::{api_router, ui_router, AppState};
use burrowmq_storage::{InMemoryStore, PersistentStore, QueueEngine, Storage};
use opentelemetry_otlp::WithExportConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing + optional OTLP
    let otlp = std::env::var("OTLP_ENDPOINT").ok();
    if let Some(endpoint) = otlp {
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
        } else {
            tracing_subscriber::fmt()
                .with_max_level(Level::INFO)
                .with_env_filter("info")
                .init();
        }
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter("info")
            .init();
    }

    let store: Arc<dyn Storage> = if let Ok(dir) = std::env::var("DATA_DIR") {
        match PersistentStore::open(std::path::PathBuf::from(dir)) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!("persistent open failed: {}, falling back to memory", e);
                Arc::new(InMemoryStore::new())
            }
        }
    } else {
        tracing::warn!("DATA_DIR unset, running without durability");
        Arc::new(InMemoryStore::new())
    };
    let engine = QueueEngine::new(store);
    let tenants = Arc::new(TenantDirectory::from_env());
    let region = std::env::var("SQS_REGION").unwrap_or_else(|_| "us-east-1".into());
    let state = AppState::new(engine, tenants, region);

    let api_port: u16 = std::env::var("SQS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3001);
    let ui_port: u16 = std::env::var("UI_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3000);
    let api_addr: SocketAddr = ([0, 0, 0, 0], api_port).into();
    let ui_addr: SocketAddr = ([0, 0, 0, 0], ui_port).into();
    info!("sqs api listening on {}", api_addr);
    info!("dashboard listening on {}", ui_addr);

    let api = api_router(state.clone());
    let ui = ui_router(state);

    let use_tls = std::env::var("TLS_CERT_PATH").is_ok() && std::env::var("TLS_KEY_PATH").is_ok();
    let (api_task, ui_task) = if use_tls {
        let cert = std::fs::read(std::env::var("TLS_CERT_PATH")?)?;
        let key = std::fs::read(std::env::var("TLS_KEY_PATH")?)?;
        let config =
            axum_server::tls_rustls::RustlsConfig::from_pem(cert.clone(), key.clone()).await?;
        let ui_config = config.clone();
        (
            tokio::spawn(async move {
                axum_server::bind_rustls(api_addr, config)
                    .serve(api.into_make_service())
                    .await
            }),
            tokio::spawn(async move {
                axum_server::bind_rustls(ui_addr, ui_config)
                    .serve(ui.into_make_service())
                    .await
            }),
        )
    } else {
        (
            tokio::spawn(async move {
                axum_server::bind(api_addr)
                    .serve(api.into_make_service())
                    .await
            }),
            tokio::spawn(async move {
                axum_server::bind(ui_addr)
                    .serve(ui.into_make_service())
                    .await
            }),
        )
    };

    let (api_res, ui_res) = tokio::try_join!(api_task, ui_task)?;
    api_res?;
    ui_res?;
    Ok(())
}
