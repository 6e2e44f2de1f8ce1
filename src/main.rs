use anyhow::{Context, Result};
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use transfer_store::{
    config::{AppConfig, RunMode, SendArgs, StoreBackend},
    db,
    orchestrator::{self, client::HttpTransferClient},
    routes,
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        RunMode::Send(args) => send(&cfg, args).await,
        RunMode::Migrate => {
            let db = db::connect(&cfg.database_url).await?;
            db::run_migrations(&db).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::MigrateLegacy => {
            let db = db::connect(&cfg.database_url).await?;
            db::run_migrations(&db).await?;
            let state = AppState::build(&cfg, db);
            let report = state.metadata.migrate_all_legacy().await?;
            println!(
                "migrated: {}, skipped: {}, failed: {}",
                report.migrated, report.skipped, report.failed
            );
            Ok(())
        }
        RunMode::Serve => serve(cfg).await,
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting transfer-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if cfg.store_backend == StoreBackend::Local && !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection and schema ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    // --- Build router ---
    let state = AppState::build(&cfg, db);
    let app = routes::routes::app(state);

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

async fn send(cfg: &AppConfig, args: SendArgs) -> Result<()> {
    let server = args.server.clone().unwrap_or_else(|| cfg.public_url.clone());
    let files = orchestrator::collect_files(&args.paths)
        .await
        .context("collecting files to send")?;

    let cancel = orchestrator::CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling uploads");
            on_ctrl_c.cancel();
        }
    });

    let client = HttpTransferClient::new(&server)?;
    let request = orchestrator::SendRequest {
        files,
        password: args.password,
        creator_email: args.email,
    };
    let outcome = orchestrator::send_transfer(&client, request, cancel).await?;

    println!("Transfer {} ready: {}", outcome.transfer_id, outcome.share_url(&server));
    Ok(())
}
