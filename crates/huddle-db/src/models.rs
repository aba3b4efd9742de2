//! Database row types — these map directly to SQLite rows.
//! Distinct from the huddle-types API models to keep the DB layer
//! independent; `into_message` does the string-to-typed conversion once,
//! so corrupt rows surface as errors instead of leaking upward.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use huddle_types::models::{DirectMessage, GroupMessage};

use crate::error::{StoreError, StoreResult};

pub struct DirectMessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub receiver_name: String,
    pub content: String,
    pub read: bool,
    pub created_at: String,
}

impl DirectMessageRow {
    pub fn into_message(self) -> StoreResult<DirectMessage> {
        Ok(DirectMessage {
            id: parse_uuid(&self.id)?,
            sender_id: parse_uuid(&self.sender_id)?,
            sender_name: self.sender_name,
            receiver_id: parse_uuid(&self.receiver_id)?,
            receiver_name: self.receiver_name,
            content: self.content,
            read: self.read,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub struct GroupMessageRow {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: String,
}

impl GroupMessageRow {
    pub fn into_message(self) -> StoreResult<GroupMessage> {
        Ok(GroupMessage {
            id: parse_uuid(&self.id)?,
            group_id: parse_uuid(&self.group_id)?,
            sender_id: parse_uuid(&self.sender_id)?,
            sender_name: self.sender_name,
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Timestamps are written by Rust, not SQLite, because the conversation
/// ordering contract needs sub-second resolution.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

pub fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("uuid '{raw}': {e}")))
}
