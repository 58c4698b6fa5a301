//! Per-connection dispatcher.
//!
//! Owns a session from accept to teardown: reads bytes, extracts frames,
//! decodes records, walks the pre-auth state machine, and routes
//! authenticated requests to their handlers. Every exit path funnels through
//! `cleanup`, which is idempotent. A failed write to another session's
//! connection shuts that connection down and lets its own task finish the
//! teardown; it never fails the request being handled.
//!
//! Lock discipline: the registry lock is never held across a store call or
//! a socket write. Handles are copied out under the lock and written to
//! after it is released.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chat_protocol::{
    ChatMessage, MarkReadTarget, MessageKind, Request, ServerResponse, WireProtocol,
};
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::notices;
use crate::registry::{ClientHandle, ConnId};
use crate::server::ServerState;
use crate::storage::{StoreError, StoredMessage};

const READ_CHUNK: usize = 4096;

/// What a processed frame means for the session loop.
enum Flow {
    Continue,
    /// Leave the loop; `notify` broadcasts a logout notice during cleanup.
    Terminate { notify: bool },
}

/// The session's own connection died mid-handler.
struct SelfGone;

type HandlerResult = Result<(), SelfGone>;

/// Dispatcher entry point; spawned once per accepted connection.
pub async fn run(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let conn_id = ConnId::next();
    let (mut read_half, write_half) = stream.into_split();
    let handle = ClientHandle::new(conn_id, write_half);
    let mut session = Session {
        state,
        conn_id,
        handle: handle.clone(),
        username: None,
    };
    let notify = session.read_loop(&mut read_half).await;
    cleanup(&session.state, conn_id, &handle, notify).await;
    debug!(%peer, conn = %conn_id, "session closed");
}

struct Session {
    state: Arc<ServerState>,
    conn_id: ConnId,
    handle: ClientHandle,
    /// `Some` once authenticated.
    username: Option<String>,
}

impl Session {
    /// Read until EOF, error, shutdown, or a terminating request.
    /// Returns whether cleanup should broadcast a logout notice.
    async fn read_loop(&mut self, read_half: &mut OwnedReadHalf) -> bool {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut shutdown_rx = self.state.subscribe_shutdown();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return self.username.is_some();
                    }
                }
                read = read_half.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => return self.username.is_some(),
                        Ok(n) => n,
                        Err(e) => {
                            debug!(conn = %self.conn_id, error = %e, "read error");
                            return self.username.is_some();
                        }
                    };
                    buffer.extend_from_slice(&chunk[..n]);
                    loop {
                        match self.state.protocol.extract_frame(&mut buffer) {
                            Ok(Some(frame)) => match self.process_frame(&frame).await {
                                Flow::Continue => {}
                                Flow::Terminate { notify } => return notify,
                            },
                            Ok(None) => break,
                            Err(e) => {
                                // Corrupt header: the extractor already
                                // resynchronized; tell the client and go on.
                                debug!(conn = %self.conn_id, error = %e, "framing error");
                                let response = ServerResponse::error(e.to_string());
                                if self.send_to_self(&response).await.is_err() {
                                    return self.username.is_some();
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn process_frame(&mut self, frame: &[u8]) -> Flow {
        let message = match self.state.protocol.decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn = %self.conn_id, error = %e, "undecodable frame");
                return self.respond_or_die(&ServerResponse::error(e.to_string())).await;
            }
        };

        if self.username.is_none() {
            return self.process_preauth(message).await;
        }

        let kind = message.kind;
        let request = match Request::try_from(message) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn = %self.conn_id, %kind, error = %e, "invalid request");
                return self.respond_or_die(&ServerResponse::error(e.to_string())).await;
            }
        };

        // The bound username is the acting principal from here on; the
        // record's own username field is not trusted once authenticated.
        match request {
            Request::Register { .. } | Request::Login { .. } => {
                self.respond_or_die(&ServerResponse::error(notices::ALREADY_AUTHENTICATED))
                    .await
            }
            Request::Logout { .. } => {
                info!(conn = %self.conn_id, username = self.principal(), "logout");
                Flow::Terminate { notify: true }
            }
            Request::Dm {
                recipient, content, ..
            } => {
                let result = self.handle_dm(&recipient, &content).await;
                self.flow(result)
            }
            Request::Fetch {
                count,
                conversation,
                ..
            } => {
                let result = self.handle_fetch(count, conversation.as_ref()).await;
                self.flow(result)
            }
            Request::MarkRead { target, .. } => {
                let result = self.handle_mark_read(&target).await;
                self.flow(result)
            }
            Request::Delete {
                message_ids, other, ..
            } => {
                let result = self.handle_delete(&message_ids, &other).await;
                self.flow(result)
            }
            Request::DeleteAccount { .. } => self.handle_delete_account().await,
        }
    }

    // -----------------------------------------------------------------------
    // Pre-auth state machine
    // -----------------------------------------------------------------------

    async fn process_preauth(&mut self, message: ChatMessage) -> Flow {
        match message.kind {
            MessageKind::Register => self.handle_register(message).await,
            MessageKind::Login => self.handle_login(message).await,
            kind => {
                debug!(conn = %self.conn_id, %kind, "request before login");
                let _ = self
                    .send_to_self(&ServerResponse::error(notices::LOGIN_REQUIRED))
                    .await;
                Flow::Terminate { notify: false }
            }
        }
    }

    /// Registration keeps the connection open on every outcome so the same
    /// socket can immediately retry or log in.
    async fn handle_register(&self, message: ChatMessage) -> Flow {
        let username = message.username;
        let password = message.password.unwrap_or_default();

        if let Err(reason) = validate_username(&username) {
            return self.respond_or_die(&ServerResponse::error(reason)).await;
        }
        match self.state.store.user_exists(&username) {
            Ok(true) => {
                return self
                    .respond_or_die(&ServerResponse::error(notices::USER_EXISTS))
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                let result = self.store_failure("user_exists", &e).await;
                return self.flow(result);
            }
        }
        if password.is_empty() {
            return self
                .respond_or_die(&ServerResponse::error(notices::PASSWORD_REQUIRED))
                .await;
        }
        match self.state.store.create_user(&username, &password) {
            Ok(true) => {
                info!(conn = %self.conn_id, %username, "registered");
                self.respond_or_die(&ServerResponse::success(notices::REGISTRATION_SUCCESS))
                    .await
            }
            // Lost a race with a concurrent registration.
            Ok(false) => {
                self.respond_or_die(&ServerResponse::error(notices::USER_EXISTS))
                    .await
            }
            Err(e) => {
                let result = self.store_failure("create_user", &e).await;
                self.flow(result)
            }
        }
    }

    /// Every login failure path terminates the connection.
    async fn handle_login(&mut self, message: ChatMessage) -> Flow {
        let username = message.username;
        let password = message.password.unwrap_or_default();

        if password.is_empty() {
            let _ = self
                .send_to_self(&ServerResponse::error(notices::PASSWORD_REQUIRED))
                .await;
            return Flow::Terminate { notify: false };
        }
        match self.state.store.verify_user(&username, &password) {
            Ok(true) => {}
            Ok(false) => {
                let _ = self
                    .send_to_self(&ServerResponse::error(notices::INVALID_CREDENTIALS))
                    .await;
                return Flow::Terminate { notify: false };
            }
            Err(e) => {
                error!(conn = %self.conn_id, error = %e, "verify_user failed");
                let _ = self
                    .send_to_self(&ServerResponse::error(notices::INTERNAL_ERROR))
                    .await;
                return Flow::Terminate { notify: false };
            }
        }

        // The already-online check and the bind are one critical section.
        let bound = {
            let mut registry = self.state.registry.lock().await;
            registry.bind(&username, self.handle.clone())
        };
        if !bound {
            let _ = self
                .send_to_self(&ServerResponse::error(notices::USER_ALREADY_LOGGED_IN))
                .await;
            return Flow::Terminate { notify: false };
        }
        self.username = Some(username.clone());
        info!(conn = %self.conn_id, %username, "logged in");

        // JOIN goes out before LOGIN_SUCCESS, to everyone including the new
        // session, so all observers see the same presence order.
        let join = ChatMessage::new(
            MessageKind::Join,
            username.as_str(),
            notices::user_joined(&username),
        );
        self.broadcast(&ServerResponse::success(notices::NEW_MESSAGE).with_data(join))
            .await;

        let roster = match self.roster_message(None).await {
            Ok(roster) => roster,
            Err(e) => {
                error!(conn = %self.conn_id, error = %e, "roster build failed");
                let _ = self
                    .send_to_self(&ServerResponse::error(notices::INTERNAL_ERROR))
                    .await;
                return Flow::Terminate { notify: true };
            }
        };
        let response = ServerResponse::success(notices::LOGIN_SUCCESS).with_data(roster);
        if self.send_to_self(&response).await.is_err() {
            return Flow::Terminate { notify: true };
        }

        match self.state.store.get_unread_count(&username) {
            Ok(0) => {}
            Ok(unread) => {
                let notice = ChatMessage::new(
                    MessageKind::Chat,
                    notices::SYSTEM_USER,
                    notices::unread_messages(unread),
                )
                .with_unread_count(unread);
                let response = ServerResponse::success(notices::NEW_MESSAGE)
                    .with_data(notice)
                    .with_unread_count(unread);
                if self.send_to_self(&response).await.is_err() {
                    return Flow::Terminate { notify: true };
                }
            }
            Err(e) => warn!(conn = %self.conn_id, error = %e, "unread count unavailable"),
        }
        Flow::Continue
    }

    // -----------------------------------------------------------------------
    // Authenticated handlers
    // -----------------------------------------------------------------------

    async fn handle_dm(&self, recipient: &str, content: &str) -> HandlerResult {
        let sender = self.principal().to_owned();
        match self.state.store.user_exists(recipient) {
            Ok(true) => {}
            Ok(false) => {
                let response = ServerResponse::error(notices::unknown_recipient(recipient));
                return self.send_to_self(&response).await.map_err(|_| SelfGone);
            }
            Err(e) => return self.store_failure("user_exists", &e).await,
        }

        let timestamp = Utc::now();
        let id = match self
            .state
            .store
            .store_message(&sender, recipient, content, timestamp)
        {
            Ok(id) => id,
            Err(e) => return self.store_failure("store_message", &e).await,
        };

        let mut message = ChatMessage::new(MessageKind::Dm, sender.as_str(), content)
            .with_recipients(vec![recipient.to_owned()]);
        message.message_id = Some(id);
        message.timestamp = timestamp;
        let response = ServerResponse::success(notices::NEW_MESSAGE).with_data(message);

        if self.send_to_user(recipient, &response).await {
            if let Err(e) = self.state.store.mark_delivered(id) {
                warn!(message_id = id, error = %e, "mark_delivered failed");
            }
        }
        debug!(conn = %self.conn_id, %sender, %recipient, message_id = id, "dm stored");

        // Echo to the sender so they learn the assigned id.
        self.send_to_self(&response).await.map_err(|_| SelfGone)
    }

    async fn handle_fetch(
        &self,
        count: u32,
        conversation: Option<&(String, String)>,
    ) -> HandlerResult {
        let caller = self.principal().to_owned();
        let messages = match conversation {
            Some((user1, user2)) => self
                .state
                .store
                .get_messages_between_users(user1, user2, count),
            None => self.state.store.get_unread_messages(&caller, Some(count)),
        };
        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => return self.store_failure("fetch", &e).await,
        };
        // One pre-loop total; every frame in this batch carries it.
        let total_unread = match self.state.store.get_unread_count(&caller) {
            Ok(n) => n,
            Err(e) => return self.store_failure("get_unread_count", &e).await,
        };
        debug!(conn = %self.conn_id, %caller, frames = messages.len(), "fetch");

        for stored in messages {
            let response = ServerResponse::success(notices::NEW_MESSAGE)
                .with_data(stored_to_wire(&stored))
                .with_unread_count(total_unread);
            self.send_to_self(&response).await.map_err(|_| SelfGone)?;
            if let Err(e) = self.state.store.mark_delivered(stored.id) {
                warn!(message_id = stored.id, error = %e, "mark_delivered failed");
            }
        }
        Ok(())
    }

    async fn handle_mark_read(&self, target: &MarkReadTarget) -> HandlerResult {
        let caller = self.principal().to_owned();
        let result = match target {
            MarkReadTarget::FromSender(sender) => {
                self.state.store.mark_read_from_user(&caller, sender)
            }
            MarkReadTarget::ByIds(ids) => self.state.store.mark_read(ids, &caller),
        };
        if let Err(e) = result {
            return self.store_failure("mark_read", &e).await;
        }
        let unread = match self.state.store.get_unread_count(&caller) {
            Ok(n) => n,
            Err(e) => return self.store_failure("get_unread_count", &e).await,
        };
        let notice = ChatMessage::new(MessageKind::Chat, notices::SYSTEM_USER, "")
            .with_unread_count(unread);
        let response = ServerResponse::success(notices::NEW_MESSAGE)
            .with_data(notice)
            .with_unread_count(unread);
        self.send_to_self(&response).await.map_err(|_| SelfGone)
    }

    async fn handle_delete(&self, ids: &[u32], other: &str) -> HandlerResult {
        let caller = self.principal().to_owned();
        let (deleted_count, rows) = match self.state.store.delete_messages(ids, &caller, other) {
            Ok(result) => result,
            Err(e) => return self.store_failure("delete_messages", &e).await,
        };
        debug!(conn = %self.conn_id, %caller, %other, deleted = deleted_count, "messages deleted");

        // Each online affected party learns which ids went away and how many
        // of them were unread messages addressed to that specific party.
        let mut decrements: HashMap<String, u32> = HashMap::new();
        let mut targets: HashSet<String> = HashSet::new();
        targets.insert(caller.clone());
        for row in rows {
            if row.was_unread {
                *decrements.entry(row.recipient.clone()).or_insert(0) += 1;
            }
            targets.insert(row.recipient);
        }

        for target in targets {
            let unread = decrements.get(&target).copied().unwrap_or(0);
            let notification =
                ChatMessage::new(MessageKind::DeleteNotification, caller.as_str(), "")
                    .with_message_ids(ids.to_vec())
                    .with_unread_count(unread);
            let response = ServerResponse::success(notices::NEW_MESSAGE).with_data(notification);
            if target == caller {
                self.send_to_self(&response).await.map_err(|_| SelfGone)?;
            } else {
                // Offline targets reconcile on their next fetch.
                let _ = self.send_to_user(&target, &response).await;
            }
        }
        Ok(())
    }

    async fn handle_delete_account(&self) -> Flow {
        let caller = self.principal().to_owned();
        match self.state.store.delete_user(&caller) {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .respond_or_die(&ServerResponse::error(notices::ACCOUNT_NOT_FOUND))
                    .await;
            }
            Err(e) => {
                let result = self.store_failure("delete_user", &e).await;
                return self.flow(result);
            }
        }
        info!(conn = %self.conn_id, username = %caller, "account deleted");

        let notice = ChatMessage::new(
            MessageKind::DeleteAccount,
            notices::SYSTEM_USER,
            notices::account_deleted(&caller),
        );
        self.broadcast(&ServerResponse::success(notices::NEW_MESSAGE).with_data(notice))
            .await;

        // Roster update reuses the LOGIN response shape; the departing user
        // is excluded from the active list it is about to leave.
        match self.roster_message(Some(&caller)).await {
            Ok(roster) => {
                self.broadcast(&ServerResponse::success(notices::NEW_MESSAGE).with_data(roster))
                    .await;
            }
            Err(e) => {
                warn!(conn = %self.conn_id, error = %e, "roster refresh failed after account deletion");
            }
        }
        Flow::Terminate { notify: true }
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    async fn send_to_self(&self, response: &ServerResponse) -> std::io::Result<()> {
        let frame = encode_response(&*self.state.protocol, response)?;
        self.handle.send_frame(&frame).await
    }

    /// True when the user was online and the frame was written.
    async fn send_to_user(&self, username: &str, response: &ServerResponse) -> bool {
        let Ok(frame) = encode_response(&*self.state.protocol, response) else {
            return false;
        };
        let handle = self.state.registry.lock().await.handle_for(username);
        match handle {
            None => false,
            Some(handle) => {
                if handle.send_frame(&frame).await.is_ok() {
                    true
                } else {
                    warn!(conn = %handle.id(), %username, "write failed, dropping connection");
                    handle.shutdown().await;
                    false
                }
            }
        }
    }

    async fn broadcast(&self, response: &ServerResponse) {
        broadcast_from(&self.state, response).await;
    }

    async fn respond_or_die(&self, response: &ServerResponse) -> Flow {
        match self.send_to_self(response).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Terminate {
                notify: self.username.is_some(),
            },
        }
    }

    fn flow(&self, result: HandlerResult) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(SelfGone) => Flow::Terminate {
                notify: self.username.is_some(),
            },
        }
    }

    async fn store_failure(&self, operation: &'static str, e: &StoreError) -> HandlerResult {
        error!(conn = %self.conn_id, operation, error = %e, "store operation failed");
        self.send_to_self(&ServerResponse::error(notices::INTERNAL_ERROR))
            .await
            .map_err(|_| SelfGone)
    }

    /// LOGIN-shaped roster record: all known users in `recipients`, the
    /// currently active ones in `active_users`.
    async fn roster_message(&self, exclude: Option<&str>) -> Result<ChatMessage, StoreError> {
        let all_users = self.state.store.get_all_users()?;
        let mut active_users = self.state.registry.lock().await.active_users();
        if let Some(excluded) = exclude {
            active_users.retain(|username| username != excluded);
        }
        Ok(
            ChatMessage::new(MessageKind::Login, notices::SYSTEM_USER, "")
                .with_recipients(all_users)
                .with_active_users(active_users),
        )
    }

    fn principal(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Teardown and shared outbound paths
// ---------------------------------------------------------------------------

/// Idempotent teardown: the registry removal decides which caller gets to
/// broadcast the logout notice. Socket close errors are swallowed.
pub(crate) async fn cleanup(
    state: &ServerState,
    conn_id: ConnId,
    handle: &ClientHandle,
    notify: bool,
) {
    let removed = state.registry.lock().await.remove(conn_id);
    if let Some((username, _)) = removed {
        info!(conn = %conn_id, %username, "session removed");
        if notify {
            let notice = ChatMessage::new(
                MessageKind::Logout,
                username.as_str(),
                notices::user_logged_out(&username),
            );
            let response = ServerResponse::success(notices::NEW_MESSAGE).with_data(notice);
            broadcast_from(state, &response).await;
        }
    }
    handle.shutdown().await;
}

/// Best-effort write to every authenticated session. A failed write shuts
/// that connection down; its own task then finishes the teardown.
async fn broadcast_from(state: &ServerState, response: &ServerResponse) {
    let Ok(frame) = encode_response(&*state.protocol, response) else {
        return;
    };
    let handles = state.registry.lock().await.handles();
    for handle in handles {
        if handle.send_frame(&frame).await.is_err() {
            warn!(conn = %handle.id(), "write failed during broadcast, dropping connection");
            handle.shutdown().await;
        }
    }
}

fn encode_response(
    protocol: &dyn WireProtocol,
    response: &ServerResponse,
) -> std::io::Result<Bytes> {
    protocol.encode_response(response).map_err(|e| {
        error!(error = %e, "failed to encode response");
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    })
}

fn stored_to_wire(stored: &StoredMessage) -> ChatMessage {
    let mut message = ChatMessage::new(
        MessageKind::Dm,
        stored.sender.as_str(),
        stored.content.as_str(),
    )
    .with_recipients(vec![stored.recipient.clone()]);
    message.message_id = Some(stored.id);
    message.timestamp = stored.timestamp;
    message
}

fn validate_username(username: &str) -> Result<(), &'static str> {
    if username.is_empty() {
        return Err(notices::USERNAME_REQUIRED);
    }
    if username.len() < 2 {
        return Err(notices::USERNAME_TOO_SHORT);
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(notices::INVALID_USERNAME);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("ab").is_ok());
        assert!(validate_username("alice_99").is_ok());
        assert_eq!(validate_username(""), Err(notices::USERNAME_REQUIRED));
        assert_eq!(validate_username("a"), Err(notices::USERNAME_TOO_SHORT));
        assert_eq!(
            validate_username("bad name"),
            Err(notices::INVALID_USERNAME)
        );
        assert_eq!(validate_username("héllo"), Err(notices::INVALID_USERNAME));
    }

    #[test]
    fn stored_rows_become_dm_records() {
        let stored = StoredMessage {
            id: 17,
            sender: "bob".to_owned(),
            recipient: "alice".to_owned(),
            content: "m1".to_owned(),
            timestamp: Utc::now(),
            delivered: false,
            read: false,
        };
        let wire = stored_to_wire(&stored);
        assert_eq!(wire.kind, MessageKind::Dm);
        assert_eq!(wire.username, "bob");
        assert_eq!(wire.message_id, Some(17));
        assert_eq!(wire.recipients.as_deref(), Some(&["alice".to_owned()][..]));
    }
}
