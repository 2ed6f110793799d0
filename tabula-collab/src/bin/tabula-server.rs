//! Tabula relay server

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tabula_collab::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "tabula-server")]
#[command(author, version, about = "WebSocket relay for collaborative Tabula spreadsheets")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory for room snapshots (default: keep rooms in memory only)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Seconds between snapshots of changed rooms (0 = only when a room empties)
    #[arg(long, default_value = "30")]
    snapshot_secs: u64,

    /// Frames buffered per connection before it is resynchronised
    #[arg(long, default_value = "256")]
    broadcast_capacity: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            snapshot_interval: (self.snapshot_secs > 0)
                .then(|| Duration::from_secs(self.snapshot_secs)),
            storage_path: self.storage,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Cli::parse().into_config();

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down, saving rooms");
            server.persist_all().await;
        }
    }
    ExitCode::SUCCESS
}
