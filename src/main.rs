use anyhow::{Context, Result};
use axum::Router;
use cart_server::{
    config::AppConfig,
    routes,
    services::{
        archive::HttpArchive, cart_service::CartService, cart_store::CartStore,
        space::VolumeSpace,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting cart server with config: {:?}", cfg);

    // --- Ensure staging volume exists ---
    if !fs::try_exists(&cfg.volume_path).await.unwrap_or(false) {
        fs::create_dir_all(&cfg.volume_path)
            .await
            .with_context(|| format!("creating volume {}", cfg.volume_path.display()))?;
        tracing::info!("Created staging volume at {}", cfg.volume_path.display());
    }

    // --- Initialize SQLite connection ---
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url `{}`", cfg.database_url))?
        .create_if_missing(true)
        .foreign_keys(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let store = CartStore::new(db.clone());
    let applied = store.migrate().await?;
    tracing::info!("Applied {} schema statements", applied);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let archive = Arc::new(HttpArchive::new(
        cfg.archive_url.clone(),
        cfg.archive_timeout(),
    )?);
    let space = Arc::new(VolumeSpace::new(cfg.volume_path.clone()));
    let (service, _dispatcher) = CartService::start(&cfg, db, archive, space);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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
