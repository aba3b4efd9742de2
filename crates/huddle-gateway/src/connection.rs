use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_db::{Database, StoreResult};
use huddle_types::events::{ClientEvent, ServerEvent};
use huddle_types::models::{Identity, UserStatus};

use crate::sessions::{SessionRegistry, TypingTarget};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The bearer token was
/// already resolved at the HTTP upgrade layer, so the connection goes
/// straight to Ready and the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    registry: SessionRegistry,
    db: Arc<Database>,
    identity: Identity,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", identity.name, identity.id);

    let ready = ServerEvent::Ready {
        user_id: identity.id,
        name: identity.name.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (conn_id, mut session_rx, first_for_user) = registry.register(identity.id).await;

    // Catch the new client up on who is already online
    for (user_id, status) in registry.online_users().await {
        if user_id == identity.id {
            continue;
        }
        let event = ServerEvent::UserStatusUpdate { user_id, status };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            registry.teardown(conn_id).await;
            return;
        }
    }

    // First session for this user announces them online to everyone else
    if first_for_user {
        registry
            .broadcast(ServerEvent::UserStatusUpdate {
                user_id: identity.id,
                status: UserStatus::Online,
            })
            .await;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward session events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read events from the client
    let registry_recv = registry.clone();
    let db_recv = db.clone();
    let identity_recv = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(&registry_recv, &db_recv, &identity_recv, conn_id, &text)
                        .await;
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some((user_id, last_for_user)) = registry.teardown(conn_id).await
        && last_for_user
    {
        registry
            .broadcast(ServerEvent::UserStatusUpdate {
                user_id,
                status: UserStatus::Offline,
            })
            .await;
    }
    info!("{} ({}) disconnected from gateway", identity.name, identity.id);
}

/// Parse and route one inbound text frame. A malformed payload is logged
/// and dropped; the connection stays open.
async fn handle_text_frame(
    registry: &SessionRegistry,
    db: &Arc<Database>,
    who: &Identity,
    conn_id: Uuid,
    text: &str,
) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => {
            handle_client_event(registry, db, who, conn_id, event).await;
        }
        Err(e) => {
            warn!(
                "{} ({}) bad event: {} -- raw: {}",
                who.name,
                who.id,
                e,
                truncate_at_char_boundary(text, 200)
            );
        }
    }
}

/// Cap a raw frame for logging without slicing inside a multibyte character.
fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Route one inbound event. Handled to completion before the next event on
/// this connection is read; store lookups are the only suspension points.
async fn handle_client_event(
    registry: &SessionRegistry,
    db: &Arc<Database>,
    who: &Identity,
    conn_id: Uuid,
    event: ClientEvent,
) {
    match event {
        ClientEvent::SendPrivateMessage {
            receiver_id,
            content,
        } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                warn!("{} sent an empty private message, ignoring", who.id);
                return;
            }
            if receiver_id == who.id {
                warn!("{} tried to message themselves, ignoring", who.id);
                return;
            }
            let exists = {
                let db = db.clone();
                blocking_store(move || db.user_exists(receiver_id)).await
            };
            if exists != Some(true) {
                warn!("{} sent to unknown receiver {}, ignoring", who.id, receiver_id);
                return;
            }

            // The durable write happens over HTTP; this id only keys the
            // live event on the client side.
            let id = Uuid::new_v4();
            let created_at = chrono::Utc::now();

            let delivered = registry
                .send_to_user(
                    receiver_id,
                    ServerEvent::NewPrivateMessage {
                        id,
                        sender_id: who.id,
                        sender_name: who.name.clone(),
                        receiver_id,
                        content: content.clone(),
                        created_at,
                    },
                )
                .await;
            if delivered == 0 {
                // Not an error: the receiver catches up on next fetch
                debug!("receiver {} offline, dropped live message", receiver_id);
            }

            // Keep the sender's other tabs in sync
            registry
                .send_to_user_except(
                    who.id,
                    Some(conn_id),
                    ServerEvent::MessageSent {
                        id,
                        sender_id: who.id,
                        sender_name: who.name.clone(),
                        receiver_id,
                        content,
                        created_at,
                    },
                )
                .await;
        }

        ClientEvent::SendGroupMessage { group_id, content } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                warn!("{} sent an empty group message, ignoring", who.id);
                return;
            }
            // Authorization checks durable membership, never joined rooms
            let is_member = {
                let db = db.clone();
                let user_id = who.id;
                blocking_store(move || db.is_group_member(user_id, group_id)).await
            };
            if is_member != Some(true) {
                warn!(
                    "{} is not a member of group {}, dropping group message",
                    who.id, group_id
                );
                return;
            }

            registry
                .send_to_group(
                    group_id,
                    Some(conn_id),
                    ServerEvent::NewGroupMessage {
                        id: Uuid::new_v4(),
                        group_id,
                        sender_id: who.id,
                        sender_name: who.name.clone(),
                        content,
                        created_at: chrono::Utc::now(),
                    },
                )
                .await;
        }

        ClientEvent::JoinGroups(group_ids) => {
            // Only durable members may subscribe to a group's live traffic
            let memberships = {
                let db = db.clone();
                let user_id = who.id;
                blocking_store(move || {
                    group_ids
                        .into_iter()
                        .map(|gid| Ok((gid, db.is_group_member(user_id, gid)?)))
                        .collect::<StoreResult<Vec<_>>>()
                })
                .await
            };
            let Some(memberships) = memberships else {
                return;
            };

            let mut allowed = Vec::new();
            for (group_id, is_member) in memberships {
                if is_member {
                    allowed.push(group_id);
                } else {
                    warn!("{} asked to join group {} without membership", who.id, group_id);
                }
            }
            info!("{} ({}) joined {} group rooms", who.name, who.id, allowed.len());
            registry.join_groups(conn_id, allowed).await;
        }

        ClientEvent::LeaveGroup(group_id) => {
            registry.leave_group(conn_id, group_id).await;
        }

        ClientEvent::TypingPrivate {
            receiver_id,
            is_typing,
        } => {
            registry
                .set_typing(conn_id, is_typing.then_some(TypingTarget::User(receiver_id)))
                .await;
            registry
                .send_to_user(
                    receiver_id,
                    ServerEvent::UserTypingPrivate {
                        sender_id: who.id,
                        is_typing,
                    },
                )
                .await;
        }

        ClientEvent::TypingGroup { group_id, is_typing } => {
            // Room subscription gates typing chatter; message sends are the
            // only path that checks durable membership
            if !registry.has_joined(conn_id, group_id).await {
                debug!("{} typing in unjoined group {}, ignoring", who.id, group_id);
                return;
            }
            registry
                .set_typing(conn_id, is_typing.then_some(TypingTarget::Group(group_id)))
                .await;
            registry
                .send_to_group(
                    group_id,
                    Some(conn_id),
                    ServerEvent::UserTypingGroup {
                        group_id,
                        user_id: who.id,
                        is_typing,
                    },
                )
                .await;
        }

        ClientEvent::UpdateStatus(status) => {
            registry.set_status(conn_id, status).await;
            registry
                .broadcast(ServerEvent::UserStatusUpdate {
                    user_id: who.id,
                    status,
                })
                .await;
        }
    }
}

/// Run a store call on the blocking pool; failures are logged and collapse
/// to `None` (the event is dropped, the connection stays open).
async fn blocking_store<T, F>(f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("store call failed: {e}");
            None
        }
        Err(e) => {
            warn!("store task join error: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn identity(name: &str) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{name}@example.com"),
        }
    }

    fn test_db(users: &[&Identity]) -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        for user in users {
            db.upsert_user(user).unwrap();
        }
        Arc::new(db)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn log_truncation_never_splits_a_multibyte_char() {
        let frame = format!("{}ééé", "x".repeat(199));
        let cut = truncate_at_char_boundary(&frame, 200);
        assert_eq!(cut.len(), 199);
        assert!(cut.ends_with('x'));

        assert_eq!(truncate_at_char_boundary("short", 200), "short");
        assert_eq!(truncate_at_char_boundary("ééé", 3), "é");
    }

    #[tokio::test]
    async fn oversized_malformed_frame_is_logged_and_dropped() {
        // Install a subscriber so the log arguments are actually evaluated,
        // as they are under the server's fmt subscriber
        let subscriber = tracing_subscriber::fmt().with_writer(std::io::sink).finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();
        let (alice_conn, _, _) = registry.register(alice.id).await;
        let (_, mut bob_rx, _) = registry.register(bob.id).await;

        // Not valid JSON, over the log cap, with a multibyte char straddling it
        let frame = format!("{}ééé", "x".repeat(199));
        handle_text_frame(&registry, &db, &alice, alice_conn, &frame).await;

        // Dropped without delivery and without panicking the recv loop
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn private_message_reaches_every_receiver_session() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();

        let (alice_conn, _alice_rx, _) = registry.register(alice.id).await;
        let (_, mut bob_rx1, _) = registry.register(bob.id).await;
        let (_, mut bob_rx2, _) = registry.register(bob.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::SendPrivateMessage {
                receiver_id: bob.id,
                content: "hello bob".into(),
            },
        )
        .await;

        for rx in [&mut bob_rx1, &mut bob_rx2] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::NewPrivateMessage {
                    sender_id, content, ..
                } => {
                    assert_eq!(*sender_id, alice.id);
                    assert_eq!(content, "hello bob");
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn private_message_to_offline_receiver_is_dropped() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();
        let (alice_conn, mut alice_rx, _) = registry.register(alice.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::SendPrivateMessage {
                receiver_id: bob.id,
                content: "anyone there?".into(),
            },
        )
        .await;

        // No delivery, no echo to the sending connection, no panic
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn sender_other_sessions_get_message_sent_echo() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();

        let (sending_conn, mut sending_rx, _) = registry.register(alice.id).await;
        let (_, mut other_tab_rx, _) = registry.register(alice.id).await;
        let (_, _bob_rx, _) = registry.register(bob.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            sending_conn,
            ClientEvent::SendPrivateMessage {
                receiver_id: bob.id,
                content: "hi".into(),
            },
        )
        .await;

        assert!(drain(&mut sending_rx).is_empty());
        let events = drain(&mut other_tab_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::MessageSent { .. }));
    }

    #[tokio::test]
    async fn empty_or_self_addressed_messages_are_ignored() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();
        let (alice_conn, _, _) = registry.register(alice.id).await;
        let (_, mut bob_rx, _) = registry.register(bob.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::SendPrivateMessage {
                receiver_id: bob.id,
                content: "   ".into(),
            },
        )
        .await;
        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::SendPrivateMessage {
                receiver_id: alice.id,
                content: "note to self".into(),
            },
        )
        .await;

        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn group_message_flows_to_joined_members_only() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let db = test_db(&[&alice, &bob, &carol]);
        let group = db
            .create_group(alice.id, "founders", &[bob.id], chrono::Utc::now())
            .unwrap();
        let registry = SessionRegistry::new();

        let (alice_conn, mut alice_rx, _) = registry.register(alice.id).await;
        let (bob_conn, mut bob_rx, _) = registry.register(bob.id).await;
        registry.join_groups(alice_conn, [group.id]).await;
        registry.join_groups(bob_conn, [group.id]).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::SendGroupMessage {
                group_id: group.id,
                content: "hello".into(),
            },
        )
        .await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::NewGroupMessage {
                group_id,
                sender_id,
                content,
                ..
            } => {
                assert_eq!(*group_id, group.id);
                assert_eq!(*sender_id, alice.id);
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // The sending connection does not hear its own message back
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn non_member_group_send_is_dropped_and_writes_nothing() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let db = test_db(&[&alice, &bob, &carol]);
        let group = db
            .create_group(alice.id, "founders", &[bob.id], chrono::Utc::now())
            .unwrap();
        let registry = SessionRegistry::new();

        let (bob_conn, mut bob_rx, _) = registry.register(bob.id).await;
        registry.join_groups(bob_conn, [group.id]).await;
        let (carol_conn, _, _) = registry.register(carol.id).await;

        handle_client_event(
            &registry,
            &db,
            &carol,
            carol_conn,
            ClientEvent::SendGroupMessage {
                group_id: group.id,
                content: "let me in".into(),
            },
        )
        .await;

        assert!(drain(&mut bob_rx).is_empty());
        assert!(db.list_group_messages(group.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_groups_requires_durable_membership() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let db = test_db(&[&alice, &bob, &carol]);
        let group = db
            .create_group(alice.id, "founders", &[bob.id], chrono::Utc::now())
            .unwrap();
        let registry = SessionRegistry::new();
        let (carol_conn, _, _) = registry.register(carol.id).await;

        handle_client_event(
            &registry,
            &db,
            &carol,
            carol_conn,
            ClientEvent::JoinGroups(vec![group.id]),
        )
        .await;

        assert!(!registry.has_joined(carol_conn, group.id).await);
    }

    #[tokio::test]
    async fn typing_indicator_reaches_the_peer() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();
        let (alice_conn, _, _) = registry.register(alice.id).await;
        let (_, mut bob_rx, _) = registry.register(bob.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::TypingPrivate {
                receiver_id: bob.id,
                is_typing: true,
            },
        )
        .await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ServerEvent::UserTypingPrivate { sender_id, is_typing: true } if sender_id == alice.id
        ));
    }

    #[tokio::test]
    async fn status_update_is_broadcast() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let db = test_db(&[&alice, &bob]);
        let registry = SessionRegistry::new();
        let (alice_conn, _, _) = registry.register(alice.id).await;
        let (_, mut bob_rx, _) = registry.register(bob.id).await;

        handle_client_event(
            &registry,
            &db,
            &alice,
            alice_conn,
            ClientEvent::UpdateStatus(UserStatus::Away),
        )
        .await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ServerEvent::UserStatusUpdate { user_id, status: UserStatus::Away } if user_id == alice.id
        ));
    }
}
