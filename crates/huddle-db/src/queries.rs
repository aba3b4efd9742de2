use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use huddle_types::models::{DirectMessage, Group, GroupMessage, Identity};

use crate::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    DirectMessageRow, GroupMessageRow, format_timestamp, parse_timestamp, parse_uuid,
};

impl Database {
    // -- Users --

    /// Mirror a resolved identity into the store. Called at the auth
    /// boundary; the id is authoritative, name/email follow the resolver.
    pub fn upsert_user(&self, identity: &Identity) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
                params![identity.id.to_string(), identity.name, identity.email],
            )?;
            Ok(())
        })
    }

    pub fn user_exists(&self, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn(|conn| user_exists(conn, user_id))
    }

    // -- Direct messages --

    pub fn create_direct_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<DirectMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::InvalidInput("empty message content".into()));
        }
        if sender_id == receiver_id {
            return Err(StoreError::InvalidInput(
                "sender and receiver must differ".into(),
            ));
        }

        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let sender_name = user_name(&tx, sender_id)?;
            let receiver_name = user_name(&tx, receiver_id)?;

            tx.execute(
                "INSERT INTO direct_messages (id, sender_id, receiver_id, content, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    id.to_string(),
                    sender_id.to_string(),
                    receiver_id.to_string(),
                    content,
                    format_timestamp(now),
                ],
            )?;
            tx.commit()?;

            Ok(DirectMessage {
                id,
                sender_id,
                sender_name,
                receiver_id,
                receiver_name,
                content: content.to_string(),
                read: false,
                created_at: now,
            })
        })
    }

    /// Flip `read` on a message addressed to `reader_id`. Marking someone
    /// else's mail is indistinguishable from a missing message.
    pub fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE direct_messages SET read = 1 WHERE id = ?1 AND receiver_id = ?2",
                params![message_id.to_string(), reader_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("message"));
            }
            Ok(())
        })
    }

    /// Remove a message entirely (no tombstone). Only a participant may
    /// delete it.
    pub fn delete_message(&self, message_id: Uuid, requester_id: Uuid) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM direct_messages
                 WHERE id = ?1 AND (sender_id = ?2 OR receiver_id = ?2)",
                params![message_id.to_string(), requester_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("message"));
            }
            Ok(())
        })
    }

    pub fn list_inbox(&self, user_id: Uuid) -> StoreResult<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            query_direct_messages(
                conn,
                "m.receiver_id = ?1",
                params![user_id.to_string()],
            )
        })
    }

    pub fn list_sent(&self, user_id: Uuid) -> StoreResult<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            query_direct_messages(conn, "m.sender_id = ?1", params![user_id.to_string()])
        })
    }

    pub fn unread_count(&self, user_id: Uuid) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM direct_messages WHERE receiver_id = ?1 AND read = 0",
                params![user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Groups --

    /// Create a group. The creator is implicitly a member; at least one
    /// other member must be named.
    pub fn create_group(
        &self,
        creator_id: Uuid,
        name: &str,
        member_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> StoreResult<Group> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 50 {
            return Err(StoreError::InvalidInput(
                "group name must be 1-50 characters".into(),
            ));
        }

        let others: BTreeSet<Uuid> = member_ids
            .iter()
            .copied()
            .filter(|id| *id != creator_id)
            .collect();
        if others.is_empty() {
            return Err(StoreError::InvalidInput(
                "a group needs at least one member besides the creator".into(),
            ));
        }

        let group_id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for id in others.iter().chain(std::iter::once(&creator_id)) {
                if !user_exists(&tx, *id)? {
                    return Err(StoreError::UnknownUser(*id));
                }
            }

            tx.execute(
                "INSERT INTO chat_groups (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![group_id.to_string(), name, format_timestamp(now)],
            )?;

            let mut all_members = vec![creator_id];
            all_members.extend(others.iter().copied());
            for member in &all_members {
                tx.execute(
                    "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                    params![group_id.to_string(), member.to_string()],
                )?;
            }
            tx.commit()?;

            Ok(Group {
                id: group_id,
                name: name.to_string(),
                member_ids: all_members,
                created_at: now,
            })
        })
    }

    pub fn is_group_member(&self, user_id: Uuid, group_id: Uuid) -> StoreResult<bool> {
        self.with_conn(|conn| is_member(conn, user_id, group_id))
    }

    pub fn add_group_member(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.with_conn(|conn| {
            if !group_exists(conn, group_id)? {
                return Err(StoreError::NotFound("group"));
            }
            if !user_exists(conn, user_id)? {
                return Err(StoreError::UnknownUser(user_id));
            }
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id.to_string(), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_string(), user_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("membership"));
            }
            Ok(())
        })
    }

    pub fn list_groups_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Group>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.created_at
                 FROM chat_groups g
                 JOIN group_members me ON me.group_id = g.id
                 WHERE me.user_id = ?1
                 ORDER BY g.created_at, g.id",
            )?;
            let headers = stmt
                .query_map(params![user_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            // One query for all memberships of the groups found above.
            let mut stmt = conn.prepare(
                "SELECT gm.group_id, gm.user_id
                 FROM group_members gm
                 JOIN group_members me ON me.group_id = gm.group_id
                 WHERE me.user_id = ?1",
            )?;
            let mut members_by_group: HashMap<String, Vec<Uuid>> = HashMap::new();
            for row in stmt.query_map(params![user_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })? {
                let (gid, uid) = row?;
                members_by_group.entry(gid).or_default().push(parse_uuid(&uid)?);
            }

            headers
                .into_iter()
                .map(|(id, name, created_at)| {
                    Ok(Group {
                        member_ids: members_by_group.remove(&id).unwrap_or_default(),
                        id: parse_uuid(&id)?,
                        name,
                        created_at: parse_timestamp(&created_at)?,
                    })
                })
                .collect()
        })
    }

    pub fn list_group_members(&self, group_id: Uuid) -> StoreResult<Vec<Identity>> {
        self.with_conn(|conn| {
            if !group_exists(conn, group_id)? {
                return Err(StoreError::NotFound("group"));
            }
            let mut stmt = conn.prepare(
                "SELECT u.id, u.name, u.email
                 FROM group_members gm
                 JOIN users u ON u.id = gm.user_id
                 WHERE gm.group_id = ?1
                 ORDER BY u.name, u.id",
            )?;
            let rows = stmt
                .query_map(params![group_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, name, email)| {
                    Ok(Identity {
                        id: parse_uuid(&id)?,
                        name,
                        email,
                    })
                })
                .collect()
        })
    }

    // -- Group messages --

    /// Membership check and insert happen inside one transaction: a
    /// non-member send fails with `NotAMember` and writes nothing.
    pub fn create_group_message(
        &self,
        sender_id: Uuid,
        group_id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<GroupMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::InvalidInput("empty message content".into()));
        }

        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if !group_exists(&tx, group_id)? {
                return Err(StoreError::NotFound("group"));
            }
            if !is_member(&tx, sender_id, group_id)? {
                return Err(StoreError::NotAMember {
                    user_id: sender_id,
                    group_id,
                });
            }
            let sender_name = user_name(&tx, sender_id)?;

            tx.execute(
                "INSERT INTO group_messages (id, group_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    group_id.to_string(),
                    sender_id.to_string(),
                    content,
                    format_timestamp(now),
                ],
            )?;
            tx.commit()?;

            Ok(GroupMessage {
                id,
                group_id,
                sender_id,
                sender_name,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    pub fn list_group_messages(&self, group_id: Uuid) -> StoreResult<Vec<GroupMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.group_id, m.sender_id, u.name, m.content, m.created_at
                 FROM group_messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.group_id = ?1
                 ORDER BY m.created_at, m.id",
            )?;
            let rows = stmt
                .query_map(params![group_id.to_string()], |row| {
                    Ok(GroupMessageRow {
                        id: row.get(0)?,
                        group_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_name: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        content: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter().map(|r| r.into_message()).collect()
        })
    }
}

fn user_exists(conn: &Connection, user_id: Uuid) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn user_name(conn: &Connection, user_id: Uuid) -> StoreResult<String> {
    conn.query_row(
        "SELECT name FROM users WHERE id = ?1",
        params![user_id.to_string()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(StoreError::UnknownUser(user_id))
}

fn group_exists(conn: &Connection, group_id: Uuid) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chat_groups WHERE id = ?1",
            params![group_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn is_member(conn: &Connection, user_id: Uuid, group_id: Uuid) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn query_direct_messages(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<DirectMessage>> {
    // JOIN users twice to fetch both display names in a single query
    let sql = format!(
        "SELECT m.id, m.sender_id, s.name, m.receiver_id, r.name, m.content, m.read, m.created_at
         FROM direct_messages m
         LEFT JOIN users s ON m.sender_id = s.id
         LEFT JOIN users r ON m.receiver_id = r.id
         WHERE {filter}
         ORDER BY m.created_at DESC, m.id DESC"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(DirectMessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                sender_name: row
                    .get::<_, Option<String>>(2)?
                    .unwrap_or_else(|| "unknown".to_string()),
                receiver_id: row.get(3)?,
                receiver_name: row
                    .get::<_, Option<String>>(4)?
                    .unwrap_or_else(|| "unknown".to_string()),
                content: row.get(5)?,
                read: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(|r| r.into_message()).collect()
}
