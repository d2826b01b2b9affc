use std::fmt;

use chrono::{DateTime, Utc};

/// Platform message id (Discord snowflake, kept opaque).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

/// Platform channel id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub String);

/// Platform user id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as fetched from the source platform. Immutable once fetched.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// Already resolved: nickname when present, username otherwise.
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachment_count: u32,
}

/// Per-channel nickname wins over the account username when it is non-empty.
pub fn resolve_display_name(username: &str, nickname: Option<&str>) -> String {
    match nickname.map(str::trim) {
        Some(nick) if !nick.is_empty() => nick.to_string(),
        _ => username.to_string(),
    }
}
