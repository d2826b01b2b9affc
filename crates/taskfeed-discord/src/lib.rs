//! Discord adapter (channel history over the REST API).
//!
//! Implements the core `MessageSource` port with
//! `GET /channels/{channel.id}/messages?limit=N&before=ID`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use taskfeed_core::{
    config::Config,
    domain::{resolve_display_name, ChannelId, ChatMessage, MessageId, UserId},
    errors::Error,
    source::port::MessageSource,
    Result,
};

const USER_AGENT: &str = concat!("DiscordBot (taskfeed, ", env!("CARGO_PKG_VERSION"), ")");

#[derive(Clone, Debug)]
pub struct DiscordClient {
    api_base: String,
    token: String,
    http: reqwest::Client,
}

impl DiscordClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Source(format!("discord http client build failed: {e}")))?;
        Ok(Self::with_http(api_base, token, http))
    }

    fn with_http(
        api_base: impl Into<String>,
        token: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.discord_api_base.clone(),
            cfg.discord_token.clone(),
            cfg.http_timeout,
        )
    }

    fn messages_url(&self, channel: &ChannelId) -> String {
        format!("{}/channels/{}/messages", self.api_base, channel.0)
    }
}

#[async_trait]
impl MessageSource for DiscordClient {
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<ChatMessage>> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(b) = before {
            query.push(("before", b.0.clone()));
        }

        let resp = self
            .http
            .get(self.messages_url(channel))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Source(format!("discord request error: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Source(format!("discord response read error: {e}")))?;

        if !status.is_success() {
            return Err(Error::Source(format!(
                "discord list messages failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let page = parse_messages(&body)?;
        tracing::debug!(channel = %channel, count = page.len(), "discord page");
        Ok(page)
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    channel_id: String,
    author: RawUser,
    #[serde(default)]
    member: Option<RawMember>,
    #[serde(default)]
    content: String,
    timestamp: String,
    #[serde(default)]
    attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(default)]
    nick: Option<String>,
}

/// Decode a channel-messages response body, keeping the API's order.
pub fn parse_messages(body: &str) -> Result<Vec<ChatMessage>> {
    let raw: Vec<RawMessage> = serde_json::from_str(body)?;
    raw.into_iter().map(into_chat_message).collect()
}

fn into_chat_message(raw: RawMessage) -> Result<ChatMessage> {
    let created_at = DateTime::parse_from_rfc3339(&raw.timestamp)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            Error::Source(format!(
                "message {} has unparseable timestamp {:?}: {e}",
                raw.id, raw.timestamp
            ))
        })?;

    let nick = raw.member.as_ref().and_then(|m| m.nick.as_deref());
    Ok(ChatMessage {
        author_name: resolve_display_name(&raw.author.username, nick),
        id: MessageId(raw.id),
        channel_id: ChannelId(raw.channel_id),
        author_id: UserId(raw.author.id),
        content: raw.content,
        created_at,
        attachment_count: u32::try_from(raw.attachments.len()).unwrap_or(u32::MAX),
    })
}
