//! Read-side conversation aggregation.
//!
//! A conversation is never persisted: it is recomputed from the flat
//! direct-message rows on every call, so it can never drift from the
//! source messages. All functions here are pure — same input, same output,
//! including ordering.
//!
//! Total order on messages is `(created_at, id)` ascending, with uuid byte
//! order breaking timestamp ties. Conversations are ordered by their last
//! message under the same order, descending.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use huddle_types::models::DirectMessage;

/// Derived per-partner view of a direct-message history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub partner_id: Uuid,
    pub partner_name: String,
    /// Ascending by `(created_at, id)`.
    pub messages: Vec<DirectMessage>,
    pub last_message: DirectMessage,
    /// Unread messages received from this partner.
    pub unread_count: u64,
}

fn sort_key(m: &DirectMessage) -> (chrono::DateTime<chrono::Utc>, Uuid) {
    (m.created_at, m.id)
}

/// Build the conversation list for `user_id` from its full message set
/// (inbox and sent together). Messages not involving `user_id` are ignored.
/// Conversations with no messages are never produced.
pub fn build_conversations(user_id: Uuid, messages: &[DirectMessage]) -> Vec<Conversation> {
    let mut by_partner: HashMap<Uuid, Vec<DirectMessage>> = HashMap::new();

    for msg in messages {
        let partner = if msg.sender_id == user_id {
            msg.receiver_id
        } else if msg.receiver_id == user_id {
            msg.sender_id
        } else {
            continue;
        };
        by_partner.entry(partner).or_default().push(msg.clone());
    }

    let mut conversations: Vec<Conversation> = by_partner
        .into_iter()
        .filter_map(|(partner_id, mut msgs)| {
            msgs.sort_by_key(sort_key);

            let last_message = msgs.last()?.clone();
            let partner_name = if last_message.sender_id == user_id {
                last_message.receiver_name.clone()
            } else {
                last_message.sender_name.clone()
            };
            let unread_count = msgs
                .iter()
                .filter(|m| m.receiver_id == user_id && !m.read)
                .count() as u64;

            Some(Conversation {
                partner_id,
                partner_name,
                messages: msgs,
                last_message,
                unread_count,
            })
        })
        .collect();

    conversations.sort_by_key(|c| std::cmp::Reverse(sort_key(&c.last_message)));
    conversations
}

/// The two-way thread between `user_id` and `partner_id`, ascending.
pub fn thread(user_id: Uuid, partner_id: Uuid, messages: &[DirectMessage]) -> Vec<DirectMessage> {
    let mut msgs: Vec<DirectMessage> = messages
        .iter()
        .filter(|m| {
            (m.sender_id == user_id && m.receiver_id == partner_id)
                || (m.sender_id == partner_id && m.receiver_id == user_id)
        })
        .cloned()
        .collect();
    msgs.sort_by_key(sort_key);
    msgs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(
        sender: Uuid,
        receiver: Uuid,
        content: &str,
        at_ms: i64,
        read: bool,
    ) -> DirectMessage {
        DirectMessage {
            id: Uuid::new_v4(),
            sender_id: sender,
            sender_name: "sender".into(),
            receiver_id: receiver,
            receiver_name: "receiver".into(),
            content: content.into(),
            read,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000 + at_ms).unwrap(),
        }
    }

    #[test]
    fn groups_by_partner_and_orders_ascending() {
        let (me, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let messages = vec![
            msg(alice, me, "from alice", 10, false),
            msg(me, alice, "to alice", 20, false),
            msg(bob, me, "from bob", 30, false),
        ];

        let convos = build_conversations(me, &messages);
        assert_eq!(convos.len(), 2);

        // Bob's message is newest, so his conversation sorts first
        assert_eq!(convos[0].partner_id, bob);
        assert_eq!(convos[1].partner_id, alice);
        assert_eq!(convos[1].messages[0].content, "from alice");
        assert_eq!(convos[1].messages[1].content, "to alice");
        assert_eq!(convos[1].last_message.content, "to alice");
    }

    #[test]
    fn messages_one_millisecond_apart_keep_send_order() {
        let (me, alice) = (Uuid::new_v4(), Uuid::new_v4());
        let messages = vec![
            msg(alice, me, "second", 1, false),
            msg(alice, me, "first", 0, false),
        ];

        let convos = build_conversations(me, &messages);
        assert_eq!(convos[0].messages[0].content, "first");
        assert_eq!(convos[0].messages[1].content, "second");
        assert_eq!(convos[0].last_message.content, "second");
    }

    #[test]
    fn equal_timestamps_tie_break_on_id() {
        let (me, alice) = (Uuid::new_v4(), Uuid::new_v4());
        let mut first = msg(alice, me, "low id", 0, false);
        let mut second = msg(alice, me, "high id", 0, false);
        first.id = Uuid::from_u128(1);
        second.id = Uuid::from_u128(2);

        // Present them in both input orders; output order must not change
        for input in [vec![second.clone(), first.clone()], vec![first.clone(), second.clone()]] {
            let convos = build_conversations(me, &input);
            assert_eq!(convos[0].messages[0].content, "low id");
            assert_eq!(convos[0].messages[1].content, "high id");
        }
    }

    #[test]
    fn repeated_calls_yield_identical_output() {
        let (me, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let messages = vec![
            msg(alice, me, "a1", 5, false),
            msg(me, bob, "b1", 5, true),
            msg(bob, me, "b2", 7, false),
            msg(me, alice, "a2", 9, true),
        ];

        let once = build_conversations(me, &messages);
        let twice = build_conversations(me, &messages);

        let render = |cs: &[Conversation]| serde_json::to_string(cs).unwrap();
        assert_eq!(render(&once), render(&twice));
    }

    #[test]
    fn unread_counts_only_messages_received_and_unread() {
        let (me, alice) = (Uuid::new_v4(), Uuid::new_v4());
        let messages = vec![
            msg(alice, me, "unread 1", 0, false),
            msg(alice, me, "unread 2", 1, false),
            msg(alice, me, "already read", 2, true),
            // Own unread flag on a sent message must not count
            msg(me, alice, "sent", 3, false),
        ];

        let convos = build_conversations(me, &messages);
        assert_eq!(convos[0].unread_count, 2);
    }

    #[test]
    fn no_messages_means_no_conversations() {
        let me = Uuid::new_v4();
        assert!(build_conversations(me, &[]).is_empty());

        // Traffic between two other people never materializes a conversation
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let foreign = vec![msg(x, y, "not mine", 0, false)];
        assert!(build_conversations(me, &foreign).is_empty());
    }

    #[test]
    fn thread_filters_to_one_partner_both_directions() {
        let (me, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let messages = vec![
            msg(alice, me, "a->me", 0, false),
            msg(me, alice, "me->a", 1, false),
            msg(bob, me, "b->me", 2, false),
        ];

        let t = thread(me, alice, &messages);
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].content, "a->me");
        assert_eq!(t[1].content, "me->a");
    }

    #[test]
    fn conversation_order_is_stable_for_equal_last_timestamps() {
        let (me, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut a = msg(alice, me, "a", 0, false);
        let mut b = msg(bob, me, "b", 0, false);
        a.id = Uuid::from_u128(1);
        b.id = Uuid::from_u128(2);

        let convos = build_conversations(me, &[a, b.clone()]);
        // Higher (created_at, id) sorts first; ties fall back to message id
        assert_eq!(convos[0].partner_id, bob);
        assert_eq!(convos[1].partner_id, alice);
    }
}
