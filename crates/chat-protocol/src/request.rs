//! The dispatcher-facing request union.
//!
//! A decoded [`ChatMessage`] is a loose record; `Request` is the validated
//! view the server dispatches on. Conversion failures name what was wrong so
//! the dispatcher can echo them back as error responses.

use thiserror::Error;

use crate::{ChatMessage, MessageKind};

/// Default history depth when a fetch carries no count (or zero).
pub const DEFAULT_FETCH_COUNT: u32 = 10;

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    Logout {
        username: String,
    },
    Dm {
        sender: String,
        recipient: String,
        content: String,
    },
    Fetch {
        username: String,
        count: u32,
        /// `Some` when the client asked for the history between two users.
        conversation: Option<(String, String)>,
    },
    MarkRead {
        username: String,
        target: MarkReadTarget,
    },
    Delete {
        username: String,
        message_ids: Vec<u32>,
        /// The conversation partner the ids must belong to.
        other: String,
    },
    DeleteAccount {
        username: String,
    },
}

/// What a mark-read request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkReadTarget {
    /// Every unread message from this sender.
    FromSender(String),
    /// These specific ids (restricted to the caller as recipient).
    ByIds(Vec<u32>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("'{0}' is not a client request kind")]
    NotARequest(MessageKind),
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("a direct message requires exactly one recipient")]
    MissingRecipient,
    #[error("mark_read requires message ids or a sender")]
    MissingMarkReadTarget,
    #[error("delete requires message ids and the conversation partner")]
    IncompleteDelete,
}

impl Request {
    /// The acting principal.
    pub fn username(&self) -> &str {
        match self {
            Request::Register { username, .. }
            | Request::Login { username, .. }
            | Request::Logout { username }
            | Request::Fetch { username, .. }
            | Request::MarkRead { username, .. }
            | Request::Delete { username, .. }
            | Request::DeleteAccount { username } => username,
            Request::Dm { sender, .. } => sender,
        }
    }
}

impl TryFrom<ChatMessage> for Request {
    type Error = RequestError;

    fn try_from(msg: ChatMessage) -> Result<Self, Self::Error> {
        let recipients = msg.recipients.unwrap_or_default();
        match msg.kind {
            MessageKind::Register => Ok(Request::Register {
                username: msg.username,
                password: msg.password.unwrap_or_default(),
            }),
            MessageKind::Login => Ok(Request::Login {
                username: msg.username,
                password: msg.password.unwrap_or_default(),
            }),
            MessageKind::Logout => Ok(Request::Logout {
                username: msg.username,
            }),
            MessageKind::Dm => {
                let mut recipients = recipients;
                if recipients.len() != 1 {
                    return Err(RequestError::MissingRecipient);
                }
                if msg.content.is_empty() {
                    return Err(RequestError::EmptyContent);
                }
                Ok(Request::Dm {
                    sender: msg.username,
                    recipient: recipients.remove(0),
                    content: msg.content,
                })
            }
            MessageKind::Fetch => {
                let conversation = if recipients.len() == 2 {
                    let mut it = recipients.into_iter();
                    Some((
                        it.next().unwrap_or_default(),
                        it.next().unwrap_or_default(),
                    ))
                } else {
                    None
                };
                let count = match msg.fetch_count {
                    None | Some(0) => DEFAULT_FETCH_COUNT,
                    Some(n) => n,
                };
                Ok(Request::Fetch {
                    username: msg.username,
                    count,
                    conversation,
                })
            }
            MessageKind::MarkRead => {
                let mut recipients = recipients;
                if !recipients.is_empty() {
                    Ok(Request::MarkRead {
                        username: msg.username,
                        target: MarkReadTarget::FromSender(recipients.remove(0)),
                    })
                } else {
                    match msg.message_ids {
                        Some(ids) if !ids.is_empty() => Ok(Request::MarkRead {
                            username: msg.username,
                            target: MarkReadTarget::ByIds(ids),
                        }),
                        _ => Err(RequestError::MissingMarkReadTarget),
                    }
                }
            }
            MessageKind::Delete => {
                let mut recipients = recipients;
                let ids = msg.message_ids.unwrap_or_default();
                if ids.is_empty() || recipients.is_empty() {
                    return Err(RequestError::IncompleteDelete);
                }
                Ok(Request::Delete {
                    username: msg.username,
                    message_ids: ids,
                    other: recipients.remove(0),
                })
            }
            MessageKind::DeleteAccount => Ok(Request::DeleteAccount {
                username: msg.username,
            }),
            kind => Err(RequestError::NotARequest(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_requires_one_recipient_and_content() {
        let msg = ChatMessage::new(MessageKind::Dm, "alice", "hi");
        assert_eq!(
            Request::try_from(msg),
            Err(RequestError::MissingRecipient)
        );

        let msg = ChatMessage::new(MessageKind::Dm, "alice", "")
            .with_recipients(vec!["bob".to_owned()]);
        assert_eq!(Request::try_from(msg), Err(RequestError::EmptyContent));

        let msg = ChatMessage::new(MessageKind::Dm, "alice", "hi")
            .with_recipients(vec!["bob".to_owned()]);
        assert_eq!(
            Request::try_from(msg),
            Ok(Request::Dm {
                sender: "alice".to_owned(),
                recipient: "bob".to_owned(),
                content: "hi".to_owned(),
            })
        );
    }

    #[test]
    fn fetch_defaults_count_and_detects_conversation_mode() {
        let msg = ChatMessage::new(MessageKind::Fetch, "alice", "");
        match Request::try_from(msg).unwrap() {
            Request::Fetch {
                count,
                conversation,
                ..
            } => {
                assert_eq!(count, DEFAULT_FETCH_COUNT);
                assert!(conversation.is_none());
            }
            other => panic!("expected Fetch, got {other:?}"),
        }

        let msg = ChatMessage::new(MessageKind::Fetch, "alice", "")
            .with_fetch_count(0)
            .with_recipients(vec!["alice".to_owned(), "bob".to_owned()]);
        match Request::try_from(msg).unwrap() {
            Request::Fetch {
                count,
                conversation,
                ..
            } => {
                assert_eq!(count, DEFAULT_FETCH_COUNT);
                assert_eq!(
                    conversation,
                    Some(("alice".to_owned(), "bob".to_owned()))
                );
            }
            other => panic!("expected Fetch, got {other:?}"),
        }
    }

    #[test]
    fn mark_read_prefers_sender_over_ids() {
        let msg = ChatMessage::new(MessageKind::MarkRead, "alice", "")
            .with_recipients(vec!["bob".to_owned()])
            .with_message_ids(vec![1, 2]);
        match Request::try_from(msg).unwrap() {
            Request::MarkRead { target, .. } => {
                assert_eq!(target, MarkReadTarget::FromSender("bob".to_owned()));
            }
            other => panic!("expected MarkRead, got {other:?}"),
        }

        let msg = ChatMessage::new(MessageKind::MarkRead, "alice", "");
        assert_eq!(
            Request::try_from(msg),
            Err(RequestError::MissingMarkReadTarget)
        );
    }

    #[test]
    fn notification_kinds_are_not_requests() {
        for kind in [
            MessageKind::ServerResponse,
            MessageKind::Join,
            MessageKind::Chat,
            MessageKind::DeleteNotification,
        ] {
            let msg = ChatMessage::new(kind, "alice", "x");
            assert_eq!(Request::try_from(msg), Err(RequestError::NotARequest(kind)));
        }
    }
}
