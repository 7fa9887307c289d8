use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

pub type GroupId = i64;
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Chatting,
    Ticket,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        use MessageKind::*;
        match self {
            Chatting => "CHATTING",
            Ticket => "TICKET",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHATTING" => Ok(MessageKind::Chatting),
            "TICKET" => Ok(MessageKind::Ticket),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

/// A persisted chat message. Ordered by `sent_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "messageId")]
    pub id: String,
    #[serde(alias = "fitGroupId")]
    pub group_id: GroupId,
    #[serde(rename = "userId")]
    pub author_user_id: UserId,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "messageTime", with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(rename = "messageType", default)]
    pub kind: MessageKind,
}

/// What a client sends over its socket. Group and author come from the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSubmission {
    pub message_id: Option<String>,
    pub message: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub message_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub message_type: MessageKind,
}

impl ChatSubmission {
    pub fn into_message(self, group_id: GroupId, author_user_id: UserId) -> ChatMessage {
        ChatMessage {
            id: self
                .message_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            group_id,
            author_user_id,
            body: self.message,
            sent_at: self.message_time.unwrap_or_else(OffsetDateTime::now_utc),
            kind: self.message_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub message_id: String,
    pub reason: String,
}

/// Frames pushed from the server to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum ServerFrame {
    Message(ChatMessage),
    Failure(FailureNotice),
}

/// Parses a v1 wire timestamp (RFC 3339 with offset).
///
/// Query strings decode `+` to a space, so `2024-05-01T10:00:00 09:00` is
/// read as `2024-05-01T10:00:00+09:00`.
pub fn parse_wire_time(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    let raw = raw.trim();
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(ts) => Ok(ts),
        Err(err) if raw.contains(' ') => {
            OffsetDateTime::parse(&raw.replace(' ', "+"), &Rfc3339).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn message_uses_wire_field_names() {
        let msg = ChatMessage {
            id: "m-1".into(),
            group_id: 42,
            author_user_id: 7,
            body: "hi".into(),
            sent_at: datetime!(2024-05-01 10:00:00 +09:00),
            kind: MessageKind::Ticket,
        };
        let value = serde_json::to_value(ServerFrame::Message(msg)).unwrap();
        assert_eq!(value["frame"], "message");
        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["groupId"], 42);
        assert_eq!(value["userId"], 7);
        assert_eq!(value["messageTime"], "2024-05-01T10:00:00+09:00");
        assert_eq!(value["messageType"], "TICKET");
    }

    #[test]
    fn legacy_group_field_is_accepted() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"messageId":"a","fitGroupId":3,"userId":1,"message":"x","messageTime":"2024-05-01T01:00:00.123456789Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.group_id, 3);
        assert_eq!(msg.kind, MessageKind::Chatting);
        assert_eq!(msg.sent_at.nanosecond(), 123_456_789);
    }

    #[test]
    fn submission_takes_identity_from_connection() {
        let sub: ChatSubmission = serde_json::from_str(r#"{"message":"hello","userId":999}"#).unwrap();
        let msg = sub.into_message(42, 7);
        assert_eq!(msg.group_id, 42);
        assert_eq!(msg.author_user_id, 7);
        assert!(Uuid::parse_str(&msg.id).is_ok());
    }

    #[test]
    fn wire_time_repairs_decoded_plus() {
        let ts = parse_wire_time("2024-05-01T10:00:00 09:00").unwrap();
        assert_eq!(ts, datetime!(2024-05-01 01:00:00 UTC));
        assert!(parse_wire_time("yesterday").is_err());
    }
}
