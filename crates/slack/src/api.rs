use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tally_core::config::SlackConfig;
use tally_core::{DirectoryUser, Reaction};
use thiserror::Error;
use tracing::debug;

use crate::blocks::{Block, MessageTemplate};

const UPLOAD_BYTES_STEP: &str = "files.upload_url";

#[derive(Debug, Error)]
pub enum SlackApiError {
    #[error("slack api `{method}` returned error `{code}`")]
    Api { method: &'static str, code: String },
    #[error("slack api `{method}` request failed: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("slack api `{method}` returned HTTP {status}")]
    Status { method: &'static str, status: u16 },
    #[error("slack api `{method}` returned an undecodable body: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("slack http client could not be built: {0}")]
    Client(#[source] reqwest::Error),
}

impl SlackApiError {
    /// Slack's own error code when the API answered, otherwise a local classification.
    pub fn code(&self) -> &str {
        match self {
            Self::Api { code, .. } => code,
            Self::Transport { .. } => "request_failed",
            Self::Status { .. } => "http_error",
            Self::Decode { .. } => "invalid_response",
            Self::Client(_) => "client_unavailable",
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Api { method, .. }
            | Self::Transport { method, .. }
            | Self::Status { method, .. }
            | Self::Decode { method, .. } => method,
            Self::Client(_) => "client",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub channel: String,
    pub thread_ts: Option<String>,
    /// Ask Slack to apply full message formatting (`parse=full`).
    pub parse_full: bool,
    pub template: MessageTemplate,
}

impl OutgoingMessage {
    pub fn new(channel: impl Into<String>, template: MessageTemplate) -> Self {
        Self { channel: channel.into(), thread_ts: None, parse_full: false, template }
    }

    pub fn parse_full(mut self) -> Self {
        self.parse_full = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

/// A text snippet shared into a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnippetUpload {
    pub channel: String,
    pub thread_ts: String,
    pub filename: String,
    pub content: String,
    pub initial_comment: String,
}

/// The slice of the Slack Web API the bot depends on.
#[async_trait]
pub trait SlackWebApi: Send + Sync {
    async fn resolve_permalink(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<String, SlackApiError>;

    /// Reactions on a message; empty when the message has none.
    async fn list_reactions(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<Vec<Reaction>, SlackApiError>;

    /// One unpaginated `users.list` page.
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, SlackApiError>;

    async fn post_message(&self, message: &OutgoingMessage)
        -> Result<PostedMessage, SlackApiError>;

    async fn upload_snippet(&self, upload: &SnippetUpload) -> Result<(), SlackApiError>;
}

pub struct HttpSlackClient {
    client: Client,
    base_url: String,
    bot_token: SecretString,
}

impl HttpSlackClient {
    pub fn new(
        base_url: impl Into<String>,
        bot_token: SecretString,
        timeout: Duration,
    ) -> Result<Self, SlackApiError> {
        let client = Client::builder().timeout(timeout).build().map_err(SlackApiError::Client)?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { client, base_url, bot_token })
    }

    pub fn from_config(config: &SlackConfig) -> Result<Self, SlackApiError> {
        Self::new(
            config.api_base_url.clone(),
            config.bot_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    fn get(&self, method: &str) -> RequestBuilder {
        self.client.get(self.method_url(method)).bearer_auth(self.bot_token.expose_secret())
    }

    fn post(&self, method: &str) -> RequestBuilder {
        self.client.post(self.method_url(method)).bearer_auth(self.bot_token.expose_secret())
    }

    async fn call<T>(
        &self,
        method: &'static str,
        request: RequestBuilder,
    ) -> Result<T, SlackApiError>
    where
        T: DeserializeOwned,
    {
        debug!(event_name = "egress.slack.api_call", method, "calling slack web api");

        let response = request
            .send()
            .await
            .map_err(|source| SlackApiError::Transport { method, source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SlackApiError::Status { method, status: status.as_u16() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|source| SlackApiError::Transport { method, source })?;
        decode_envelope(method, body)
    }
}

/// Splits Slack's `{ "ok": bool, "error": ... }` envelope from the method payload.
fn decode_envelope<T>(method: &'static str, body: Value) -> Result<T, SlackApiError>
where
    T: DeserializeOwned,
{
    let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if !ok {
        let code =
            body.get("error").and_then(Value::as_str).unwrap_or("unknown_error").to_owned();
        return Err(SlackApiError::Api { method, code });
    }

    serde_json::from_value(body).map_err(|source| SlackApiError::Decode { method, source })
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink: String,
}

#[derive(Debug, Deserialize)]
struct ReactionsResponse {
    message: ReactedMessage,
}

#[derive(Debug, Deserialize)]
struct ReactedMessage {
    /// Slack omits the field entirely when a message has no reactions.
    #[serde(default)]
    reactions: Option<Vec<Reaction>>,
}

impl ReactedMessage {
    fn into_reactions(self) -> Vec<Reaction> {
        self.reactions.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct UsersListResponse {
    #[serde(default)]
    members: Vec<MemberRecord>,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    id: String,
    #[serde(default)]
    profile: Option<MemberProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct MemberProfile {
    #[serde(default)]
    email: Option<String>,
}

impl From<MemberRecord> for DirectoryUser {
    fn from(member: MemberRecord) -> Self {
        let email = member.profile.and_then(|profile| profile.email);
        DirectoryUser::new(member.id, email.as_deref())
    }
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    blocks: &'a [Block],
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    channel: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct UploadUrlResponse {
    upload_url: String,
    file_id: String,
}

#[derive(Debug, Serialize)]
struct CompleteUploadRequest<'a> {
    files: [CompleteUploadFile<'a>; 1],
    channel_id: &'a str,
    thread_ts: &'a str,
    initial_comment: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteUploadFile<'a> {
    id: &'a str,
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct Acknowledged {}

/// Slack refuses zero-length uploads, so an empty snippet is sent as a lone newline.
fn upload_bytes(content: &str) -> Vec<u8> {
    if content.is_empty() {
        b"\n".to_vec()
    } else {
        content.as_bytes().to_vec()
    }
}

#[async_trait]
impl SlackWebApi for HttpSlackClient {
    async fn resolve_permalink(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<String, SlackApiError> {
        const METHOD: &str = "chat.getPermalink";
        let request =
            self.get(METHOD).query(&[("channel", channel_id), ("message_ts", message_ts)]);
        let response: PermalinkResponse = self.call(METHOD, request).await?;
        Ok(response.permalink)
    }

    async fn list_reactions(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<Vec<Reaction>, SlackApiError> {
        const METHOD: &str = "reactions.get";
        let request = self.get(METHOD).query(&[
            ("channel", channel_id),
            ("timestamp", message_ts),
            ("full", "true"),
        ]);
        let response: ReactionsResponse = self.call(METHOD, request).await?;
        Ok(response.message.into_reactions())
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, SlackApiError> {
        const METHOD: &str = "users.list";
        let response: UsersListResponse = self.call(METHOD, self.get(METHOD)).await?;
        Ok(response.members.into_iter().map(DirectoryUser::from).collect())
    }

    async fn post_message(
        &self,
        message: &OutgoingMessage,
    ) -> Result<PostedMessage, SlackApiError> {
        const METHOD: &str = "chat.postMessage";
        let body = PostMessageRequest {
            channel: &message.channel,
            text: &message.template.fallback_text,
            blocks: &message.template.blocks,
            thread_ts: message.thread_ts.as_deref(),
            parse: message.parse_full.then_some("full"),
        };
        let response: PostMessageResponse =
            self.call(METHOD, self.post(METHOD).json(&body)).await?;
        Ok(PostedMessage { channel: response.channel, ts: response.ts })
    }

    async fn upload_snippet(&self, upload: &SnippetUpload) -> Result<(), SlackApiError> {
        const RESERVE: &str = "files.getUploadURLExternal";
        const COMPLETE: &str = "files.completeUploadExternal";

        let bytes = upload_bytes(&upload.content);
        let length = bytes.len().to_string();
        let reserve = self
            .post(RESERVE)
            .form(&[("filename", upload.filename.as_str()), ("length", length.as_str())]);
        let reserved: UploadUrlResponse = self.call(RESERVE, reserve).await?;

        let response = self
            .client
            .post(&reserved.upload_url)
            .body(bytes)
            .send()
            .await
            .map_err(|source| SlackApiError::Transport { method: UPLOAD_BYTES_STEP, source })?;
        if !response.status().is_success() {
            return Err(SlackApiError::Status {
                method: UPLOAD_BYTES_STEP,
                status: response.status().as_u16(),
            });
        }

        let complete = CompleteUploadRequest {
            files: [CompleteUploadFile { id: &reserved.file_id, title: &upload.filename }],
            channel_id: &upload.channel,
            thread_ts: &upload.thread_ts,
            initial_comment: &upload.initial_comment,
        };
        let _: Acknowledged = self.call(COMPLETE, self.post(COMPLETE).json(&complete)).await?;
        Ok(())
    }
}
