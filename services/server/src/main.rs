// chat-server: Persistent multi-user chat service over raw TCP.

use std::path::PathBuf;
use std::sync::Arc;

use chat_protocol::ProtocolKind;
use chat_server::storage::MessageStore;
use chat_server::{ChatServer, ServerConfig, SqliteStore};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chat-server", about = "Persistent multi-user chat server")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Wire protocol spoken by this process
    #[arg(long, value_enum, default_value_t = ProtocolArg::Json)]
    protocol: ProtocolArg,
    /// Path to the SQLite database file
    #[arg(long, default_value = "chat.db")]
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ProtocolArg {
    Json,
    Custom,
}

impl From<ProtocolArg> for ProtocolKind {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Json => ProtocolKind::Json,
            ProtocolArg::Custom => ProtocolKind::Custom,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "chat server starting");

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        protocol: args.protocol.into(),
        db_path: args.db_path,
    };

    let store: Arc<dyn MessageStore> = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open database: {e}");
            std::process::exit(1);
        }
    };

    let server = match ChatServer::bind(&config, store).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let state = server.state();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            state.begin_shutdown();
        }
    });

    server.run().await;
    info!("server shutdown complete");
}
