//! Integration tests for group delivery/read tracking and the membership
//! synchronizer.

mod common;

use chatverse_server::db::models::{GroupRecord, MessageType};
use chatverse_server::error::ChatError;
use chatverse_server::groups::membership::{self, GroupDraft, JoinRequest};
use chatverse_server::groups::messages;
use chatverse_server::presence::coordinator;
use chatverse_server::store::{GroupDirectory, MessageStore};
use chatverse_server::ws::Room;
use common::{connect, create_group, harness, ids, set, Client, Harness};

async fn say(h: &Harness, client: &Client, group: &GroupRecord, body: &str) -> String {
    messages::send_group_message(&h.state, &client.session, &group.id, body, MessageType::Text)
        .await
        .unwrap()
        .id
}

fn join(group: &GroupRecord, user_id: Option<&str>, invited: bool) -> JoinRequest {
    JoinRequest {
        group_id: group.id.clone(),
        user_id: user_id.map(str::to_string),
        invited,
        message: None,
    }
}

/// Id of the newest message in the group that `user_id` has not read.
fn latest_unread(h: &Harness, group: &GroupRecord, user_id: &str) -> String {
    h.store
        .find_unread_group(&group.id, user_id)
        .unwrap()
        .pop()
        .expect("no unread message")
}

#[tokio::test]
async fn test_group_message_delivered_to_online_members_then_caught_up() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;

    let id = say(&h, &alice, &group, "anyone here?").await;
    let stored = h.store.get_group_message(&id).unwrap().unwrap();
    assert_eq!(stored.delivered_to, set(&["alice"]));
    assert_eq!(stored.read_by, set(&["alice"]));

    let _bob = connect(&h, "bob").await;
    let stored = h.store.get_group_message(&id).unwrap().unwrap();
    assert_eq!(stored.delivered_to, set(&["alice", "bob"]));
    assert_eq!(stored.read_by, set(&["alice"]));

    let carol = connect(&h, "carol").await;
    let read = messages::read_group_messages(&h.state, &carol.session, &group.id)
        .await
        .unwrap();
    assert!(read.contains(&id));
    let stored = h.store.get_group_message(&id).unwrap().unwrap();
    assert_eq!(stored.delivered_to, set(&["alice", "bob", "carol"]));
    assert_eq!(stored.read_by, set(&["alice", "carol"]));
}

#[tokio::test]
async fn test_catch_up_notifies_open_conversations() {
    let h = harness();
    let mut alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob"], false).await;
    membership::open_group_chat(&h.state, &alice.session, &group.id)
        .await
        .unwrap();
    let id = say(&h, &alice, &group, "ping").await;
    alice.clear();

    let _bob = connect(&h, "bob").await;

    let delivered = alice.events("group-messages-delivered");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["userId"], "bob");
    assert!(ids(&delivered[0]["messageIds"]).contains(&id));
}

#[tokio::test]
async fn test_message_streams_follow_rooms() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;
    let mut bob = connect(&h, "bob").await;
    let mut carol = connect(&h, "carol").await;
    let mut alice = alice;

    // dave is not a member and cannot open the conversation
    let dave = connect(&h, "dave").await;
    let err = membership::open_group_chat(&h.state, &dave.session, &group.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);
    assert!(!dave.session.handle.in_room(&Room::GroupChat(group.id.clone())));

    membership::open_group_chat(&h.state, &bob.session, &group.id)
        .await
        .unwrap();
    alice.clear();
    bob.clear();
    carol.clear();

    let id = say(&h, &alice, &group, "hello").await;

    let full = bob.events("new-group-message");
    assert_eq!(full.len(), 1);
    assert_eq!(full[0]["message"]["id"], id.as_str());
    assert_eq!(full[0]["sender"]["username"], "Alice");

    let summaries = carol.events("new-group-notification");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["latestMessage"]["senderName"], "Alice");

    // The sender gets neither.
    assert!(alice.drain().is_empty());

    membership::close_group_chat(&bob.session, &group.id);
    bob.clear();
    say(&h, &alice, &group, "again").await;
    assert!(bob.events("new-group-message").is_empty());
}

#[tokio::test]
async fn test_non_member_cannot_send_or_read() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &[], false).await;
    let dave = connect(&h, "dave").await;

    let err = messages::send_group_message(&h.state, &dave.session, &group.id, "hi", MessageType::Text)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Authorization(_)));

    let err = messages::read_group_messages(&h.state, &dave.session, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn test_bulk_and_single_reads_converge() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;
    let mut alice = alice;
    let bob = connect(&h, "bob").await;
    let carol = connect(&h, "carol").await;

    let first = say(&h, &alice, &group, "one").await;
    let second = say(&h, &alice, &group, "two").await;
    alice.clear();

    // bob reads one at a time, twice over
    for id in [&first, &second, &first, &second] {
        messages::read_group_message(&h.state, &bob.session, id)
            .await
            .unwrap();
    }
    let receipts = alice.events("group-message-read");
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0]["readerId"], "bob");

    // carol reads everything at once, twice over
    messages::read_group_messages(&h.state, &carol.session, &group.id)
        .await
        .unwrap();
    assert!(messages::read_group_messages(&h.state, &carol.session, &group.id)
        .await
        .unwrap()
        .is_empty());
    messages::read_group_messages(&h.state, &bob.session, &group.id)
        .await
        .unwrap();

    for id in [&first, &second] {
        let stored = h.store.get_group_message(id).unwrap().unwrap();
        assert_eq!(stored.read_by, set(&["alice", "bob", "carol"]));
        assert!(stored.read_by.is_subset(&stored.delivered_to));
    }
}

#[tokio::test]
async fn test_admin_removal_of_online_member() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;
    let mut bob = connect(&h, "bob").await;
    membership::open_group_chat(&h.state, &bob.session, &group.id)
        .await
        .unwrap();
    bob.clear();

    membership::remove_member(&h.state, &alice.session, &group.id, "bob")
        .await
        .unwrap();

    // bob's connection leaves the rooms but stays registered
    assert!(!bob.session.handle.in_room(&Room::Group(group.id.clone())));
    assert!(!bob.session.handle.in_room(&Room::GroupChat(group.id.clone())));
    assert!(h.state.connections.is_online("bob"));
    assert!(!h.state.presence.is_online_in(&group.id, "bob"));
    assert!(!h.store.get_group(&group.id).unwrap().unwrap().is_member("bob"));

    let removed = bob.events("removed-from-group");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0]["actorName"], "Alice");

    let notice = latest_unread(&h, &group, "carol");
    let notice = h.store.get_group_message(&notice).unwrap().unwrap();
    assert!(notice.is_notification);
    assert_eq!(notice.message, "Alice has removed Bob from the group.");
    assert_eq!(notice.delivered_to, h.state.presence.online_members(&group.id));
    assert_eq!(notice.delivered_to, set(&["alice"]));

    // bob no longer hears about the group
    say(&h, &alice, &group, "bye bob").await;
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn test_only_admins_act_on_other_members() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;
    let bob = connect(&h, "bob").await;
    let _carol = connect(&h, "carol").await;

    let err = membership::remove_member(&h.state, &bob.session, &group.id, "carol")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);
    assert!(h.state.presence.is_online_in(&group.id, "carol"));

    let err = membership::join_group(&h.state, &bob.session, join(&group, Some("dave"), false))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "You do not have permission to add members.");

    let err = membership::rename_member(&h.state, &bob.session, &group.id, "carol", "Caz")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    let err = membership::remove_member(&h.state, &alice.session, &group.id, "alice")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);

    let record = h.store.get_group(&group.id).unwrap().unwrap();
    assert_eq!(record.members, set(&["alice", "bob", "carol"]));
}

#[tokio::test]
async fn test_creator_loses_rights_after_leaving() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob", "carol"], false).await;

    membership::leave_group(&h.state, &alice.session, &group.id)
        .await
        .unwrap();

    let err = membership::remove_member(&h.state, &alice.session, &group.id, "bob")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    let err = membership::join_group(&h.state, &alice.session, join(&group, Some("dave"), false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    let record = h.store.get_group(&group.id).unwrap().unwrap();
    assert_eq!(record.created_by, "alice");
    assert!(!record.can_manage("alice"));
    assert_eq!(record.members, set(&["bob", "carol"]));
}

#[tokio::test]
async fn test_join_rules() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let private = create_group(&h, &alice, "secret", &[], true).await;
    let mut dave = connect(&h, "dave").await;
    let mut carol = connect(&h, "carol").await;

    let err = membership::join_group(&h.state, &dave.session, join(&private, None, false))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "This group is private");
    assert!(!h.state.presence.is_online_in(&private.id, "dave"));

    dave.clear();
    membership::join_group(&h.state, &dave.session, join(&private, None, true))
        .await
        .unwrap();
    assert!(h.state.presence.is_online_in(&private.id, "dave"));
    assert!(dave.session.handle.in_room(&Room::Group(private.id.clone())));
    let joined = dave.events("joined-group");
    assert_eq!(joined[0]["group"]["id"], private.id.as_str());

    let err = membership::join_group(&h.state, &dave.session, join(&private, None, true))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Already a member of this group");

    // admin path ignores privacy
    carol.clear();
    membership::join_group(&h.state, &alice.session, join(&private, Some("carol"), false))
        .await
        .unwrap();
    assert!(h.state.presence.is_online_in(&private.id, "carol"));
    let joined = carol.events("joined-group");
    assert_eq!(joined[0]["addedBy"], "Alice");

    let notice = latest_unread(&h, &private, "bob");
    let notice = h.store.get_group_message(&notice).unwrap().unwrap();
    assert_eq!(notice.message, "Alice added Carol");
}

#[tokio::test]
async fn test_leave_group_updates_presence_and_room() {
    let h = harness();
    let mut alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob"], false).await;
    let mut bob = connect(&h, "bob").await;
    alice.clear();
    bob.clear();

    membership::leave_group(&h.state, &bob.session, &group.id)
        .await
        .unwrap();

    assert!(!h.state.presence.is_online_in(&group.id, "bob"));
    assert!(!bob.session.handle.in_room(&Room::Group(group.id.clone())));

    let changes = alice.events("group-membership-changed");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["memberId"], "bob");
    assert_eq!(changes[0]["change"]["kind"], "left");
    assert_eq!(bob.events("group-membership-changed").len(), 1);

    let err = membership::leave_group(&h.state, &bob.session, &group.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    // Reconnecting does not put bob back.
    coordinator::disconnect(&h.state, &bob.session).await;
    let _bob = connect(&h, "bob").await;
    assert!(!h.state.presence.is_online_in(&group.id, "bob"));
}

#[tokio::test]
async fn test_create_group_seeds_presence_and_notifies() {
    let h = harness();
    let mut alice = connect(&h, "alice").await;
    let mut bob = connect(&h, "bob").await;
    alice.clear();
    bob.clear();

    let group = membership::create_group(
        &h.state,
        &alice.session,
        GroupDraft {
            name: "Rust".into(),
            handle: "rust".into(),
            description: "crabs".into(),
            members: set(&["bob", "carol", "ghost"]),
            is_private: false,
            group_icon: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(group.members, set(&["alice", "bob", "carol"]));
    assert_eq!(group.admins, set(&["alice"]));
    assert_eq!(h.state.presence.online_members(&group.id), set(&["alice", "bob"]));

    let added = bob.events("added-to-group");
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["group"]["handle"], "rust");
    assert_eq!(added[0]["latestMessage"]["message"], "Alice created the group!");
    assert_eq!(alice.events("group-created").len(), 1);

    let notice = latest_unread(&h, &group, "carol");
    let notice = h.store.get_group_message(&notice).unwrap().unwrap();
    assert_eq!(notice.delivered_to, set(&["alice", "bob"]));

    let err = membership::create_group(
        &h.state,
        &bob.session,
        GroupDraft {
            name: "Other".into(),
            handle: "rust".into(),
            description: "dup".into(),
            members: Default::default(),
            is_private: false,
            group_icon: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "Group already exists");

    let err = membership::create_group(
        &h.state,
        &bob.session,
        GroupDraft {
            name: "".into(),
            handle: "empty".into(),
            description: "x".into(),
            members: Default::default(),
            is_private: false,
            group_icon: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 400);
}

#[tokio::test]
async fn test_rename_member_keeps_admin_set() {
    let h = harness();
    let mut alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob"], false).await;
    let bob = connect(&h, "bob").await;
    alice.clear();

    membership::rename_member(&h.state, &bob.session, &group.id, "bob", "Bobby")
        .await
        .unwrap();
    membership::rename_member(&h.state, &alice.session, &group.id, "bob", "Robert")
        .await
        .unwrap();

    let record = h.store.get_group(&group.id).unwrap().unwrap();
    assert_eq!(record.display_name("bob", "Bob"), "Robert");
    assert_eq!(record.admins, set(&["alice"]));

    let changes = alice.events("group-membership-changed");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1]["change"]["kind"], "renamed");
    assert_eq!(changes[1]["change"]["displayName"], "Robert");

    let notice = latest_unread(&h, &group, "bob");
    let notice = h.store.get_group_message(&notice).unwrap().unwrap();
    assert_eq!(notice.message, "Alice renamed Bobby to Robert");
}

/// U is in a group's online set iff U has a session and the directory lists
/// U as a member, after racing lifecycle and membership changes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_presence_invariant_under_interleaving() {
    let h = harness();
    let alice = connect(&h, "alice").await;
    let group = create_group(&h, &alice, "rust", &["bob"], false).await;

    let check = |h: &Harness| {
        let record = h.store.get_group(&group.id).unwrap().unwrap();
        let expected = h.state.connections.is_online("bob") && record.is_member("bob");
        assert_eq!(h.state.presence.is_online_in(&group.id, "bob"), expected);
    };

    for _ in 0..20 {
        let bob = connect(&h, "bob").await;
        let (left, removed) = tokio::join!(
            coordinator::disconnect(&h.state, &bob.session),
            membership::remove_member(&h.state, &alice.session, &group.id, "bob"),
        );
        assert!(left);
        removed.unwrap();
        check(&h);

        let (handle, _rx) = chatverse_server::ws::ConnectionHandle::channel();
        let (connected, joined) = tokio::join!(
            coordinator::connect(&h.state, "bob", handle),
            membership::join_group(&h.state, &alice.session, join(&group, Some("bob"), false)),
        );
        joined.unwrap();
        let bob = connected.unwrap();
        check(&h);

        coordinator::disconnect(&h.state, &bob).await;
        check(&h);
    }
}
