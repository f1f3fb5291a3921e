use log::{error, info};
use pagesync_collab::{AccessDirectory, ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let access = AccessDirectory::from_env();
    if access.is_open() {
        info!("No PAGESYNC_TOKENS configured, trusting client-claimed user ids");
    }

    let server = match SyncServer::with_access(config, access) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open event log: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting pagesync server on {}", server.bind_addr());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down ({} connections served, {} events persisted)",
                stats.total_connections, stats.events_persisted
            );
        }
    }
}
