use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tally_core::{ShortcutInvocation, UserId};
use thiserror::Error;

use crate::shortcut::ShortcutError;

const REDACTED: &str = "***";

#[derive(Clone, Debug, PartialEq)]
pub enum InboundRequest {
    /// Slack's periodic certificate probe (`ssl_check=1`).
    SslCheck,
    UrlVerification { challenge: String },
    Envelope(SlackEnvelope),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlackEnvelope {
    pub correlation_id: String,
    pub event: SlackEvent,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    MessageShortcut(ShortcutInvocation),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::MessageShortcut(_) => "message_action",
            Self::Unsupported { event_type } => event_type,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("request body is not valid utf-8")]
    NotUtf8,
    #[error("interaction body has no `payload` field")]
    MissingPayload,
    #[error("payload is not valid json: {0}")]
    InvalidJson(String),
    #[error("`{event_type}` payload is missing `{field}`")]
    MissingField { event_type: String, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    #[serde(rename = "type")]
    kind: String,
    callback_id: Option<String>,
    trigger_id: Option<String>,
    action_ts: Option<String>,
    message_ts: Option<String>,
    user: Option<IdRef>,
    channel: Option<IdRef>,
    team: Option<IdRef>,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

/// Decodes an inbound Slack request body.
///
/// Interactive callbacks arrive form encoded with the JSON in `payload`;
/// Events API requests arrive as a bare JSON body.
pub fn parse_inbound(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<InboundRequest, PayloadError> {
    let is_json = content_type
        .map(|value| value.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        return parse_json_body(body);
    }

    let mut payload = None;
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "ssl_check" if value == "1" => return Ok(InboundRequest::SslCheck),
            "payload" => payload = Some(value.into_owned()),
            _ => {}
        }
    }

    let payload = payload.ok_or(PayloadError::MissingPayload)?;
    let value: Value = serde_json::from_str(&payload)
        .map_err(|error| PayloadError::InvalidJson(error.to_string()))?;
    envelope_from_value(value).map(InboundRequest::Envelope)
}

fn parse_json_body(body: &[u8]) -> Result<InboundRequest, PayloadError> {
    let text = std::str::from_utf8(body).map_err(|_| PayloadError::NotUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|error| PayloadError::InvalidJson(error.to_string()))?;

    if value.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = value
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingField {
                event_type: "url_verification".to_owned(),
                field: "challenge",
            })?
            .to_owned();
        return Ok(InboundRequest::UrlVerification { challenge });
    }

    let event_type = value
        .pointer("/event/type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    let correlation_id =
        value.get("event_id").and_then(Value::as_str).unwrap_or("unknown-event").to_owned();

    Ok(InboundRequest::Envelope(SlackEnvelope {
        correlation_id,
        event: SlackEvent::Unsupported { event_type },
        payload: value,
    }))
}

fn envelope_from_value(value: Value) -> Result<SlackEnvelope, PayloadError> {
    let payload: InteractionPayload = serde_json::from_value(value.clone())
        .map_err(|error| PayloadError::InvalidJson(error.to_string()))?;

    let correlation_id = payload
        .trigger_id
        .clone()
        .or_else(|| payload.action_ts.clone())
        .unwrap_or_else(|| "unknown-correlation-id".to_owned());

    let event = match payload.kind.as_str() {
        "message_action" => SlackEvent::MessageShortcut(shortcut_invocation(payload)?),
        other => SlackEvent::Unsupported { event_type: other.to_owned() },
    };

    Ok(SlackEnvelope { correlation_id, event, payload: value })
}

fn shortcut_invocation(payload: InteractionPayload) -> Result<ShortcutInvocation, PayloadError> {
    let missing = |field: &'static str| PayloadError::MissingField {
        event_type: payload.kind.clone(),
        field,
    };

    let invocation = ShortcutInvocation {
        callback_id: payload.callback_id.clone().ok_or_else(|| missing("callback_id"))?,
        user_id: UserId(
            payload.user.as_ref().map(|user| user.id.clone()).ok_or_else(|| missing("user.id"))?,
        ),
        channel_id: payload
            .channel
            .as_ref()
            .map(|channel| channel.id.clone())
            .ok_or_else(|| missing("channel.id"))?,
        message_ts: payload.message_ts.clone().ok_or_else(|| missing("message_ts"))?,
        action_ts: payload.action_ts.clone().ok_or_else(|| missing("action_ts"))?,
        trigger_id: payload.trigger_id.clone(),
        team_id: payload.team.as_ref().map(|team| team.id.clone()),
    };
    Ok(invocation)
}

/// A copy of `payload` with every token-bearing field masked, for debug dumps.
pub fn redacted_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if is_token_key(key) && !value.is_null() {
                        Value::String(REDACTED.to_owned())
                    } else {
                        redacted_payload(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redacted_payload).collect()),
        other => other.clone(),
    }
}

fn is_token_key(key: &str) -> bool {
    key == "token" || key.ends_with("_token")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
}

#[derive(Debug, Error)]
pub enum EventHandlerError {
    #[error(transparent)]
    Shortcut(#[from] ShortcutError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("shortcut `{callback_id}` failed: {source}")]
    Handler {
        callback_id: String,
        #[source]
        source: EventHandlerError,
    },
}

#[async_trait]
pub trait ShortcutHandler: Send + Sync {
    fn callback_id(&self) -> &str;

    async fn handle(
        &self,
        invocation: &ShortcutInvocation,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

/// Routes message shortcuts to handlers by callback id.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<String, Arc<dyn ShortcutHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: ShortcutHandler + 'static,
    {
        self.handlers.insert(handler.callback_id().to_owned(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let SlackEvent::MessageShortcut(invocation) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };
        let Some(handler) = self.handlers.get(&invocation.callback_id) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(invocation, ctx).await.map_err(|source| DispatchError::Handler {
            callback_id: invocation.callback_id.clone(),
            source,
        })
    }

    pub fn handles(&self, callback_id: &str) -> bool {
        self.handlers.contains_key(callback_id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
