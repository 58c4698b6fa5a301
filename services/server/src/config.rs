//! Launch-time parameters.
//!
//! The launch surface is CLI flags only; both sides of a deployment must
//! pick the same protocol out-of-band.

use std::path::PathBuf;

use chat_protocol::ProtocolKind;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
    pub db_path: PathBuf,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8000,
            protocol: ProtocolKind::Json,
            db_path: PathBuf::from("chat.db"),
        }
    }
}
