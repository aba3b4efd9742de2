use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserStatus;

/// Events sent FROM client TO server over the gateway WebSocket.
///
/// Wire format is `{"type": "<event>", "data": <payload>}` with snake_case
/// event names and camelCase payload fields. These names are the
/// compatibility surface for existing clients; renaming any breaks them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Ask the server to relay a one-to-one message to the receiver's live
    /// sessions. Does NOT persist — the durable write is the HTTP call.
    SendPrivateMessage { receiver_id: Uuid, content: String },

    /// Relay a message to everyone joined to the group room. The sender
    /// must be a durable member of the group.
    SendGroupMessage { group_id: Uuid, content: String },

    /// Subscribe this connection to live updates for the given groups.
    JoinGroups(Vec<Uuid>),

    /// Unsubscribe this connection from a group room.
    LeaveGroup(Uuid),

    /// Typing indicator toward a single user.
    TypingPrivate { receiver_id: Uuid, is_typing: bool },

    /// Typing indicator inside a group room.
    TypingGroup { group_id: Uuid, is_typing: bool },

    /// Announce a presence status change.
    UpdateStatus(UserStatus),
}

/// Events sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection acknowledged; the token resolved to this identity.
    Ready { user_id: Uuid, name: String },

    /// A private message addressed to this user.
    NewPrivateMessage {
        id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        receiver_id: Uuid,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// Echo of a private message to the sender's other sessions, so every
    /// open tab shows the outgoing message without refetching.
    MessageSent {
        id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        receiver_id: Uuid,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A message posted to a group room this connection has joined.
    NewGroupMessage {
        id: Uuid,
        group_id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// Someone is typing in a private conversation with this user.
    UserTypingPrivate { sender_id: Uuid, is_typing: bool },

    /// Someone is typing in a group room this connection has joined.
    UserTypingGroup {
        group_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    /// A user's presence status changed.
    UserStatusUpdate { user_id: Uuid, status: UserStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_names() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"type":"send_private_message","data":{"receiverId":"6f0f5f43-9c5a-4b5e-8f0a-3b1c2d4e5f60","content":"hi"}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::SendPrivateMessage { content, .. } => assert_eq!(content, "hi"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn join_groups_payload_is_bare_array() {
        let id = Uuid::new_v4();
        let ev = ClientEvent::JoinGroups(vec![id]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "join_groups");
        assert!(json["data"].is_array());
    }

    #[test]
    fn status_serializes_lowercase() {
        let ev = ClientEvent::UpdateStatus(UserStatus::Away);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["data"], "away");
    }

    #[test]
    fn server_event_payload_fields_are_camel_case() {
        let ev = ServerEvent::UserTypingGroup {
            group_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            is_typing: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "user_typing_group");
        assert_eq!(json["data"]["isTyping"], true);
        assert!(json["data"].get("groupId").is_some());
    }
}
