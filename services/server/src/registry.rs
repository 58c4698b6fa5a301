//! Session registry: which username owns which connection.
//!
//! Two maps, kept inverse of each other, guarded by one mutex in
//! `ServerState`. Handles are cloned out under the lock and written to after
//! it is released; a frame write holds the handle's own lock for the
//! duration of the write so frames from different tasks never interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable write handle to one client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnId,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl ClientHandle {
    pub fn new(id: ConnId, writer: OwnedWriteHalf) -> Self {
        ClientHandle {
            id,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Write one complete frame; exclusive for the duration of the write.
    pub async fn send_frame(&self, frame: &Bytes) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await
    }

    /// Close the connection. Errors are swallowed; the peer may be gone.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[derive(Default)]
pub struct Registry {
    by_conn: HashMap<ConnId, String>,
    by_user: HashMap<String, ClientHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Bind `username` to the connection behind `handle`.
    /// False (and no change) when the username is already online.
    pub fn bind(&mut self, username: &str, handle: ClientHandle) -> bool {
        if self.by_user.contains_key(username) {
            return false;
        }
        self.by_conn.insert(handle.id(), username.to_owned());
        self.by_user.insert(username.to_owned(), handle);
        true
    }

    /// Remove the connection's mappings. `None` when the connection was
    /// never authenticated or was already removed, which makes teardown
    /// idempotent across racing cleanup paths.
    pub fn remove(&mut self, id: ConnId) -> Option<(String, ClientHandle)> {
        let username = self.by_conn.remove(&id)?;
        let handle = self.by_user.remove(&username);
        handle.map(|handle| (username, handle))
    }

    pub fn handle_for(&self, username: &str) -> Option<ClientHandle> {
        self.by_user.get(username).cloned()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.by_user.contains_key(username)
    }

    /// Sorted for stable rosters in responses.
    pub fn active_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.by_user.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn handles(&self) -> Vec<ClientHandle> {
        self.by_user.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }

    /// The two maps must stay exact inverses; checked by tests after every
    /// mutation sequence.
    #[cfg(test)]
    fn is_bijective(&self) -> bool {
        self.by_conn.len() == self.by_user.len()
            && self.by_conn.iter().all(|(id, username)| {
                self.by_user
                    .get(username)
                    .is_some_and(|handle| handle.id() == *id)
            })
    }
}
