use std::process::ExitCode;
use std::sync::Arc;

use cowrite_sync::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &config.storage_path {
        Some(path) => info!("Starting cowrite server with RocksDB at {}", path.display()),
        None => info!("Starting cowrite server with in-memory snapshots"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to open snapshot store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = serving => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("Server task failed: {e}");
                return ExitCode::FAILURE;
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    let report = server.shutdown().await;
    if !report.is_clean() {
        for (doc_id, e) in &report.failed {
            error!("Unsaved document {doc_id}: {e}");
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
