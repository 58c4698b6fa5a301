// chat-server: core library for the persistent chat service — durable
// store, session registry, per-connection dispatcher, and TCP listener.

pub mod auth;
pub mod config;
pub mod notices;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use config::ServerConfig;
pub use server::{ChatServer, ServerError, ServerState};
pub use storage::{MessageStore, SqliteStore, StoreError};
