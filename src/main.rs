use anyhow::{Context, Result};
use axum::Router;
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{catalog::Catalog, storage_service::StorageService};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting bucket-store with config: {:?}", cfg);

    // --- Catalog (optional) ---
    let catalog = match &cfg.database_url {
        Some(url) => {
            tracing::debug!("Connecting catalog => {}", url);
            Some(
                Catalog::connect(url)
                    .await
                    .with_context(|| format!("opening catalog at {}", url))?,
            )
        }
        None => {
            tracing::info!("No database URL configured; index is memory-only");
            None
        }
    };

    // --- Handle migration mode ---
    if migrate {
        let Some(catalog) = catalog else {
            anyhow::bail!("--migrate needs a database URL");
        };
        let applied = catalog.migrate().await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let storage = StorageService::open(&cfg.storage_dir, catalog, cfg.orphan_policy)
        .await
        .with_context(|| format!("opening storage at {}", cfg.storage_dir))?;

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
