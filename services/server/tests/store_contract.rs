//! Store contract tests against the embedded SQLite implementation.
//!
//! Validates the invariants the dispatcher relies on:
//! - ids are strictly increasing in insertion order
//! - unread_count(u) always equals the number of unread rows addressed to u
//! - mark_read only touches rows where the caller is the recipient
//! - delete_messages is scoped to one conversation and reports unread state
//! - delete_user cascades over both sender and recipient roles

use chat_server::storage::{MessageStore, SqliteStore};
use chrono::Utc;

fn store_with_users(users: &[&str]) -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("open in-memory store");
    for user in users {
        assert!(store.create_user(user, "pw").expect("create user"));
    }
    store
}

fn send(store: &SqliteStore, sender: &str, recipient: &str, content: &str) -> u32 {
    store
        .store_message(sender, recipient, content, Utc::now())
        .expect("store message")
}

// ---------------------------------------------------------------------------
// Users and credentials
// ---------------------------------------------------------------------------

#[test]
fn duplicate_username_is_rejected() {
    let store = store_with_users(&["alice"]);
    assert!(!store.create_user("alice", "other").unwrap());
    // The original password still verifies; the duplicate never landed.
    assert!(store.verify_user("alice", "pw").unwrap());
    assert!(!store.verify_user("alice", "other").unwrap());
}

#[test]
fn verify_rejects_unknown_user_and_wrong_password() {
    let store = store_with_users(&["alice"]);
    assert!(!store.verify_user("ghost", "pw").unwrap());
    assert!(!store.verify_user("alice", "wrong").unwrap());
    assert!(store.verify_user("alice", "pw").unwrap());
}

#[test]
fn user_exists_tracks_lifecycle() {
    let store = store_with_users(&["alice"]);
    assert!(store.user_exists("alice").unwrap());
    assert!(!store.user_exists("bob").unwrap());
    assert!(store.delete_user("alice").unwrap());
    assert!(!store.user_exists("alice").unwrap());
    assert!(!store.delete_user("alice").unwrap());
}

#[test]
fn all_users_lists_every_account() {
    let store = store_with_users(&["carol", "alice", "bob"]);
    assert_eq!(store.get_all_users().unwrap(), vec!["alice", "bob", "carol"]);
}

// ---------------------------------------------------------------------------
// Message ids and ordering
// ---------------------------------------------------------------------------

#[test]
fn ids_are_strictly_increasing() {
    let store = store_with_users(&["alice", "bob"]);
    let mut last = 0;
    for i in 0..20 {
        let id = send(&store, "alice", "bob", &format!("m{i}"));
        assert!(id > last, "id {id} not greater than previous {last}");
        last = id;
    }
}

#[test]
fn unread_fetch_is_oldest_first_and_limited() {
    let store = store_with_users(&["alice", "bob"]);
    for i in 0..5 {
        send(&store, "bob", "alice", &format!("m{i}"));
    }
    let all = store.get_unread_messages("alice", None).unwrap();
    let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

    let limited = store.get_unread_messages("alice", Some(2)).unwrap();
    let contents: Vec<&str> = limited.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1"]);
}

#[test]
fn conversation_fetch_covers_both_directions() {
    let store = store_with_users(&["alice", "bob", "carol"]);
    send(&store, "alice", "bob", "a1");
    send(&store, "bob", "alice", "b1");
    send(&store, "alice", "carol", "other");
    send(&store, "alice", "bob", "a2");

    let conversation = store.get_messages_between_users("alice", "bob", 10).unwrap();
    let contents: Vec<&str> = conversation.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["a1", "b1", "a2"]);
}

// ---------------------------------------------------------------------------
// Unread accounting
// ---------------------------------------------------------------------------

#[test]
fn unread_count_equals_unread_rows() {
    let store = store_with_users(&["alice", "bob"]);
    let m1 = send(&store, "bob", "alice", "m1");
    let m2 = send(&store, "bob", "alice", "m2");
    send(&store, "alice", "bob", "reply");
    assert_eq!(store.get_unread_count("alice").unwrap(), 2);
    assert_eq!(store.get_unread_count("bob").unwrap(), 1);

    store.mark_read(&[m1], "alice").unwrap();
    assert_eq!(store.get_unread_count("alice").unwrap(), 1);
    store.mark_read(&[m2], "alice").unwrap();
    assert_eq!(store.get_unread_count("alice").unwrap(), 0);
}

#[test]
fn mark_read_ignores_rows_addressed_to_others() {
    let store = store_with_users(&["alice", "bob"]);
    let to_bob = send(&store, "alice", "bob", "for bob");
    // Alice tries to mark a message that was addressed to bob.
    store.mark_read(&[to_bob], "alice").unwrap();
    assert_eq!(store.get_unread_count("bob").unwrap(), 1);
}

#[test]
fn mark_read_from_user_is_sender_scoped() {
    let store = store_with_users(&["alice", "bob", "carol"]);
    send(&store, "bob", "alice", "from bob");
    send(&store, "carol", "alice", "from carol");
    store.mark_read_from_user("alice", "bob").unwrap();
    assert_eq!(store.get_unread_count("alice").unwrap(), 1);
    let remaining = store.get_unread_messages("alice", None).unwrap();
    assert_eq!(remaining[0].sender, "carol");
}

#[test]
fn mark_delivered_is_idempotent_and_separate_from_read() {
    let store = store_with_users(&["alice", "bob"]);
    let id = send(&store, "bob", "alice", "hi");
    store.mark_delivered(id).unwrap();
    store.mark_delivered(id).unwrap();
    // Delivered does not mean read.
    assert_eq!(store.get_unread_count("alice").unwrap(), 1);
    let messages = store.get_unread_messages("alice", None).unwrap();
    assert!(messages[0].delivered);
    assert!(!messages[0].read);
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[test]
fn delete_messages_is_conversation_scoped() {
    let store = store_with_users(&["alice", "bob", "carol"]);
    let in_conv = send(&store, "alice", "bob", "ours");
    let other_conv = send(&store, "alice", "carol", "not ours");

    let (count, rows) = store
        .delete_messages(&[in_conv, other_conv], "alice", "bob")
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].recipient, "bob");
    assert!(rows[0].was_unread);

    // The carol message survived the alice<->bob deletion.
    assert_eq!(store.get_unread_count("carol").unwrap(), 1);
}

#[test]
fn delete_messages_reports_read_state_per_row() {
    let store = store_with_users(&["alice", "bob"]);
    let read_one = send(&store, "alice", "bob", "read");
    let unread_one = send(&store, "alice", "bob", "unread");
    store.mark_read(&[read_one], "bob").unwrap();

    let (count, rows) = store
        .delete_messages(&[read_one, unread_one], "alice", "bob")
        .unwrap();
    assert_eq!(count, 2);
    let unread_flags: Vec<bool> = rows.iter().map(|r| r.was_unread).collect();
    assert_eq!(unread_flags.iter().filter(|&&u| u).count(), 1);
    assert_eq!(store.get_unread_count("bob").unwrap(), 0);
}

#[test]
fn delete_user_cascades_both_roles() {
    let store = store_with_users(&["alice", "bob", "carol"]);
    send(&store, "alice", "bob", "sent by alice");
    send(&store, "carol", "alice", "received by alice");
    send(&store, "bob", "carol", "unrelated");

    assert!(store.delete_user("alice").unwrap());

    // No message with alice as sender or recipient remains.
    assert!(store.get_unread_messages("alice", None).unwrap().is_empty());
    assert_eq!(store.get_unread_count("bob").unwrap(), 0);
    assert!(store
        .get_messages_between_users("alice", "bob", 100)
        .unwrap()
        .is_empty());
    // The unrelated conversation is untouched.
    assert_eq!(store.get_unread_count("carol").unwrap(), 1);
    assert_eq!(store.get_all_users().unwrap(), vec!["bob", "carol"]);
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[test]
fn messages_survive_reopen() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("chat.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.create_user("alice", "pw1").unwrap();
        store.create_user("bob", "pw2").unwrap();
        store
            .store_message("bob", "alice", "persistent", Utc::now())
            .unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert!(store.verify_user("alice", "pw1").unwrap());
    let messages = store.get_unread_messages("alice", None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "persistent");
}
