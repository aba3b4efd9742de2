use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use huddle_types::events::ServerEvent;
use huddle_types::models::UserStatus;

/// Where a connection's typing indicator currently points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTarget {
    User(Uuid),
    Group(Uuid),
}

/// Runtime state of one live connection. Created on connect, destroyed on
/// disconnect; never persisted. `joined_groups` is a cache of "rooms this
/// connection wants live updates for" — distinct from durable membership,
/// and never used to authorize sends.
struct Session {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    joined_groups: HashSet<Uuid>,
    typing_to: Option<TypingTarget>,
    status: UserStatus,
}

/// Tracks every live session and routes events to them. A user may hold
/// several sessions at once (one per browser tab); fan-out reaches all of
/// them. Delivery is an in-memory channel send — it never suspends on I/O
/// and silently drops when nobody is connected.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a Session for a new connection. Returns the connection id,
    /// the event receiver to drain into the socket, and whether this is the
    /// user's first live session (drives the presence broadcast).
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut sessions = self.inner.write().await;
        let first_for_user = !sessions.values().any(|s| s.user_id == user_id);
        sessions.insert(
            conn_id,
            Session {
                user_id,
                tx,
                joined_groups: HashSet::new(),
                typing_to: None,
                status: UserStatus::Online,
            },
        );

        (conn_id, rx, first_for_user)
    }

    /// Remove a Session on disconnect. Returns the user id and whether it
    /// was the user's last live session. No persistence side effect.
    pub async fn teardown(&self, conn_id: Uuid) -> Option<(Uuid, bool)> {
        let mut sessions = self.inner.write().await;
        let session = sessions.remove(&conn_id)?;
        let last_for_user = !sessions.values().any(|s| s.user_id == session.user_id);
        Some((session.user_id, last_for_user))
    }

    pub async fn join_groups(&self, conn_id: Uuid, group_ids: impl IntoIterator<Item = Uuid>) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(&conn_id) {
            session.joined_groups.extend(group_ids);
        }
    }

    pub async fn leave_group(&self, conn_id: Uuid, group_id: Uuid) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(&conn_id) {
            session.joined_groups.remove(&group_id);
        }
    }

    pub async fn has_joined(&self, conn_id: Uuid, group_id: Uuid) -> bool {
        let sessions = self.inner.read().await;
        sessions
            .get(&conn_id)
            .is_some_and(|s| s.joined_groups.contains(&group_id))
    }

    pub async fn set_typing(&self, conn_id: Uuid, target: Option<TypingTarget>) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(&conn_id) {
            session.typing_to = target;
        }
    }

    pub async fn typing_target(&self, conn_id: Uuid) -> Option<TypingTarget> {
        let sessions = self.inner.read().await;
        sessions.get(&conn_id).and_then(|s| s.typing_to)
    }

    pub async fn set_status(&self, conn_id: Uuid, status: UserStatus) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(&conn_id) {
            session.status = status;
        }
    }

    /// Deliver an event to every live session of `user_id`. Returns how
    /// many sessions it reached; zero means the event was dropped, which is
    /// not an error (the receiver catches up over the pull path).
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.send_to_user_except(user_id, None, event).await
    }

    /// Same as `send_to_user`, but skips one originating connection.
    pub async fn send_to_user_except(
        &self,
        user_id: Uuid,
        exclude_conn: Option<Uuid>,
        event: ServerEvent,
    ) -> usize {
        let sessions = self.inner.read().await;
        let mut delivered = 0;
        for (conn_id, session) in sessions.iter() {
            if session.user_id != user_id || Some(*conn_id) == exclude_conn {
                continue;
            }
            if session.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver an event to every session joined to `group_id`, except the
    /// originating connection.
    pub async fn send_to_group(
        &self,
        group_id: Uuid,
        exclude_conn: Option<Uuid>,
        event: ServerEvent,
    ) -> usize {
        let sessions = self.inner.read().await;
        let mut delivered = 0;
        for (conn_id, session) in sessions.iter() {
            if !session.joined_groups.contains(&group_id) || Some(*conn_id) == exclude_conn {
                continue;
            }
            if session.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver an event to every live session.
    pub async fn broadcast(&self, event: ServerEvent) {
        let sessions = self.inner.read().await;
        for session in sessions.values() {
            let _ = session.tx.send(event.clone());
        }
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        let sessions = self.inner.read().await;
        sessions.values().any(|s| s.user_id == user_id)
    }

    /// Snapshot of online users and their announced status, one entry per
    /// user (not per session), for the catch-up push on connect.
    pub async fn online_users(&self) -> Vec<(Uuid, UserStatus)> {
        let sessions = self.inner.read().await;
        let mut seen: HashMap<Uuid, UserStatus> = HashMap::new();
        for session in sessions.values() {
            seen.entry(session.user_id).or_insert(session.status);
        }
        seen.into_iter().collect()
    }
}
