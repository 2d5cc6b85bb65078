//! Message types for the hosted realtime socket.
//!
//! The socket speaks the Phoenix channel protocol with JSON frames:
//! `{"topic", "event", "payload", "ref"}`. A client joins one topic with a
//! `postgres_changes` config and then receives row changes as
//! `postgres_changes` events on that topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FeedEvent;
use crate::models::Bookmark;

/// Topic joined for the bookmark feed.
pub const CHANNEL_TOPIC: &str = "realtime:bookmarks-realtime";

const HEARTBEAT_TOPIC: &str = "phoenix";
const SCHEMA: &str = "public";
const TABLE: &str = "bookmarks";

/// One Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
struct JoinPayload<'a> {
    config: JoinConfig<'a>,
    access_token: &'a str,
}

#[derive(Debug, Serialize)]
struct JoinConfig<'a> {
    postgres_changes: Vec<ChangeFilter<'a>>,
}

#[derive(Debug, Serialize)]
struct ChangeFilter<'a> {
    event: &'a str,
    schema: &'a str,
    table: &'a str,
    filter: String,
}

/// Reply to a join or heartbeat.
#[derive(Debug, Deserialize)]
struct ReplyPayload {
    status: String,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum ChangeData {
    Insert { record: Bookmark },
    Delete { old_record: DeletedRecord },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    id: String,
}

impl PhoenixMessage {
    /// Join frame subscribing to inserts and deletes of `owner_id`'s rows.
    pub fn join(owner_id: &str, access_token: &str, reference: u64) -> Self {
        let filter = format!("user_id=eq.{}", owner_id);
        let payload = JoinPayload {
            config: JoinConfig {
                postgres_changes: ["INSERT", "DELETE"]
                    .into_iter()
                    .map(|event| ChangeFilter {
                        event,
                        schema: SCHEMA,
                        table: TABLE,
                        filter: filter.clone(),
                    })
                    .collect(),
            },
            access_token,
        };

        Self {
            topic: CHANNEL_TOPIC.to_string(),
            event: "phx_join".to_string(),
            // Serializing plain structs of strings cannot fail.
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(reference: u64) -> Self {
        Self {
            topic: CHANNEL_TOPIC.to_string(),
            event: "phx_leave".to_string(),
            payload: Value::Object(Default::default()),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: Value::Object(Default::default()),
            reference: Some(reference.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// For a `phx_reply` to the frame sent with `reference`: `Ok(())` when
    /// the server accepted it, `Err(reason)` when it refused. `None` for any
    /// other frame.
    pub fn reply_status(&self, reference: u64) -> Option<Result<(), String>> {
        let expected = reference.to_string();
        if self.event != "phx_reply" || self.reference.as_deref() != Some(expected.as_str()) {
            return None;
        }

        let reply: ReplyPayload = match serde_json::from_value(self.payload.clone()) {
            Ok(reply) => reply,
            Err(e) => return Some(Err(format!("malformed reply: {}", e))),
        };

        if reply.status == "ok" {
            Some(Ok(()))
        } else {
            let reason = reply
                .response
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or(reply.status.as_str())
                .to_string();
            Some(Err(reason))
        }
    }
}

/// Maps a raw frame to a feed event. Frames that are not bookmark inserts or
/// deletes, or that do not decode, yield `None`.
pub fn decode_change(text: &str) -> Option<FeedEvent> {
    let message = PhoenixMessage::decode(text).ok()?;
    if message.event != "postgres_changes" {
        return None;
    }

    let change: ChangePayload = serde_json::from_value(message.payload).ok()?;
    match change.data {
        ChangeData::Insert { record } => Some(FeedEvent::Inserted(record)),
        ChangeData::Delete { old_record } => Some(FeedEvent::Deleted(old_record.id)),
        ChangeData::Other => None,
    }
}
