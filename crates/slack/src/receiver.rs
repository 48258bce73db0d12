use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::{
    parse_inbound, redacted_payload, EventContext, EventDispatcher, HandlerResult, InboundRequest,
    PayloadError, SlackEnvelope, SlackEvent,
};
use crate::signature::{SignatureError, SignatureVerifier};

/// The parts of an inbound HTTP request the receiver looks at.
#[derive(Clone, Copy, Debug)]
pub struct InboundHttpRequest<'a> {
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    Empty,
    Challenge(String),
}

pub struct Received {
    pub ack: Acknowledgement,
    /// Whether a background dispatch was started. [`InteractionReceiver::drain`] awaits it.
    pub dispatched: bool,
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("request signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error("request payload rejected: {0}")]
    Payload(#[from] PayloadError),
}

/// Verifies Slack requests and hands envelopes to the dispatcher.
///
/// Dispatch runs on its own task so the caller can acknowledge inside
/// Slack's three second window no matter how slow the Web API is. Those tasks
/// are tracked until [`InteractionReceiver::drain`] collects them.
pub struct InteractionReceiver {
    verifier: SignatureVerifier,
    dispatcher: Arc<EventDispatcher>,
    request_dump: bool,
    in_flight: Mutex<JoinSet<()>>,
}

impl InteractionReceiver {
    pub fn new(
        verifier: SignatureVerifier,
        dispatcher: EventDispatcher,
        request_dump: bool,
    ) -> Self {
        Self {
            verifier,
            dispatcher: Arc::new(dispatcher),
            request_dump,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn receive(
        &self,
        request: InboundHttpRequest<'_>,
        now: i64,
    ) -> Result<Received, ReceiveError> {
        if let Err(error) =
            self.verifier.verify(request.timestamp, request.signature, request.body, now)
        {
            warn!(
                event_name = "ingress.slack.signature_rejected",
                error = %error,
                "rejected slack request with invalid signature"
            );
            return Err(error.into());
        }

        let inbound = match parse_inbound(request.content_type, request.body) {
            Ok(inbound) => inbound,
            Err(error) => {
                warn!(
                    event_name = "ingress.slack.payload_rejected",
                    error = %error,
                    "rejected malformed slack payload"
                );
                return Err(error.into());
            }
        };

        match inbound {
            InboundRequest::SslCheck => {
                debug!(event_name = "ingress.slack.ssl_check", "answered slack ssl check");
                Ok(Received { ack: Acknowledgement::Empty, dispatched: false })
            }
            InboundRequest::UrlVerification { challenge } => {
                info!(
                    event_name = "ingress.slack.url_verification",
                    "answered slack url verification challenge"
                );
                Ok(Received { ack: Acknowledgement::Challenge(challenge), dispatched: false })
            }
            InboundRequest::Envelope(envelope) => {
                self.spawn_dispatch(envelope);
                Ok(Received { ack: Acknowledgement::Empty, dispatched: true })
            }
        }
    }

    /// Waits for every dispatch started so far, including ones started while
    /// draining. Returns how many finished.
    pub async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let mut tasks = std::mem::take(&mut *self.lock_in_flight());
            if tasks.is_empty() {
                return drained;
            }
            while let Some(joined) = tasks.join_next().await {
                drained += 1;
                if let Err(error) = joined {
                    warn!(
                        event_name = "dispatch.slack.aborted",
                        correlation_id = "shutdown",
                        error = %error,
                        "slack dispatch task did not finish cleanly"
                    );
                }
            }
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_dispatch(&self, envelope: SlackEnvelope) {
        let callback_id = match &envelope.event {
            SlackEvent::MessageShortcut(invocation) => Some(invocation.callback_id.clone()),
            SlackEvent::Unsupported { .. } => None,
        };

        info!(
            event_name = "ingress.slack.payload_received",
            correlation_id = %envelope.correlation_id,
            event_type = envelope.event.event_type(),
            callback_id = callback_id.as_deref().unwrap_or("none"),
            "received slack payload"
        );

        if self.request_dump {
            let dump = serde_json::to_string_pretty(&redacted_payload(&envelope.payload))
                .unwrap_or_else(|error| format!("<unserializable payload: {error}>"));
            debug!(
                event_name = "ingress.slack.request_dump",
                correlation_id = %envelope.correlation_id,
                "dumping request data for debugging...\n\n{dump}\n"
            );
        }

        if let Some(callback_id) = callback_id.as_deref() {
            if !self.dispatcher.handles(callback_id) {
                warn!(
                    event_name = "ingress.slack.unhandled_shortcut",
                    correlation_id = %envelope.correlation_id,
                    callback_id,
                    "no handler registered for shortcut"
                );
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let request_dump = self.request_dump;
        let mut in_flight = self.lock_in_flight();
        // Finished tasks are reaped here so the set only holds live work.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            let ctx = EventContext { correlation_id: envelope.correlation_id.clone() };
            match dispatcher.dispatch(&envelope, &ctx).await {
                Ok(HandlerResult::Processed) => info!(
                    event_name = "dispatch.slack.completed",
                    correlation_id = %ctx.correlation_id,
                    "slack payload processed"
                ),
                Ok(HandlerResult::Ignored) => debug!(
                    event_name = "dispatch.slack.ignored",
                    correlation_id = %ctx.correlation_id,
                    event_type = envelope.event.event_type(),
                    "slack payload ignored"
                ),
                Err(error) => warn!(
                    event_name = "dispatch.slack.failed",
                    correlation_id = %ctx.correlation_id,
                    error = %error,
                    "slack payload dispatch failed"
                ),
            }
            if request_dump {
                debug!(correlation_id = %ctx.correlation_id, "dispatch completed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tally_core::ShortcutInvocation;
    use tokio::sync::{Mutex, Notify};

    use super::{Acknowledgement, InboundHttpRequest, InteractionReceiver, ReceiveError};
    use crate::events::{
        EventContext, EventDispatcher, EventHandlerError, HandlerResult, ShortcutHandler,
    };
    use crate::signature::{SignatureError, SignatureVerifier};

    const NOW: i64 = 1_730_000_130;
    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(ShortcutInvocation, String)>>,
        release: Notify,
    }

    #[async_trait]
    impl ShortcutHandler for Arc<RecordingHandler> {
        fn callback_id(&self) -> &str {
            "count"
        }

        async fn handle(
            &self,
            invocation: &ShortcutInvocation,
            ctx: &EventContext,
        ) -> Result<HandlerResult, EventHandlerError> {
            self.release.notified().await;
            self.seen.lock().await.push((invocation.clone(), ctx.correlation_id.clone()));
            Ok(HandlerResult::Processed)
        }
    }

    fn receiver(handler: &Arc<RecordingHandler>) -> InteractionReceiver {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(Arc::clone(handler));
        let verifier = SignatureVerifier::new(SECRET.to_owned().into(), 300);
        InteractionReceiver::new(verifier, dispatcher, true)
    }

    fn shortcut_body() -> Vec<u8> {
        let payload = json!({
            "type": "message_action",
            "token": "verification-token",
            "callback_id": "count",
            "trigger_id": "trigger-1",
            "action_ts": "1730000123.456789",
            "message_ts": "1730000000.000100",
            "user": { "id": "U100" },
            "channel": { "id": "C200" }
        });
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("payload", &payload.to_string())
            .finish()
            .into_bytes()
    }

    fn signed(body: &[u8]) -> (String, String) {
        let timestamp = NOW.to_string();
        let signature =
            SignatureVerifier::new(SECRET.to_owned().into(), 300).sign(&timestamp, body);
        (timestamp, signature)
    }

    #[tokio::test]
    async fn acknowledges_before_the_handler_runs() {
        let handler = Arc::new(RecordingHandler::default());
        let receiver = receiver(&handler);
        let body = shortcut_body();
        let (timestamp, signature) = signed(&body);

        let received = receiver
            .receive(
                InboundHttpRequest {
                    timestamp: Some(&timestamp),
                    signature: Some(&signature),
                    content_type: Some("application/x-www-form-urlencoded"),
                    body: &body,
                },
                NOW,
            )
            .expect("signed request should be accepted");

        assert_eq!(received.ack, Acknowledgement::Empty);
        assert!(handler.seen.lock().await.is_empty());

        assert!(received.dispatched);
        handler.release.notify_one();
        assert_eq!(receiver.drain().await, 1);

        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.user_id.as_str(), "U100");
        assert_eq!(seen[0].1, "trigger-1");
    }

    #[tokio::test]
    async fn rejects_unsigned_and_forged_requests() {
        let handler = Arc::new(RecordingHandler::default());
        let receiver = receiver(&handler);
        let body = shortcut_body();
        let timestamp = NOW.to_string();

        let unsigned = receiver.receive(
            InboundHttpRequest {
                timestamp: Some(&timestamp),
                signature: None,
                content_type: None,
                body: &body,
            },
            NOW,
        );
        assert!(matches!(
            unsigned,
            Err(ReceiveError::Signature(SignatureError::MissingHeader(_)))
        ));

        let forged = SignatureVerifier::new("another-secret".to_owned().into(), 300)
            .sign(&timestamp, &body);
        let forged = receiver.receive(
            InboundHttpRequest {
                timestamp: Some(&timestamp),
                signature: Some(&forged),
                content_type: None,
                body: &body,
            },
            NOW,
        );
        assert!(matches!(forged, Err(ReceiveError::Signature(SignatureError::Mismatch))));
    }

    #[tokio::test]
    async fn signed_but_malformed_payload_is_a_payload_error() {
        let handler = Arc::new(RecordingHandler::default());
        let receiver = receiver(&handler);
        let body = b"payload=%7B%22type%22%3A%22message_action%22%7D".to_vec();
        let (timestamp, signature) = signed(&body);

        let result = receiver.receive(
            InboundHttpRequest {
                timestamp: Some(&timestamp),
                signature: Some(&signature),
                content_type: None,
                body: &body,
            },
            NOW,
        );

        assert!(matches!(result, Err(ReceiveError::Payload(_))));
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge_without_dispatch() {
        let handler = Arc::new(RecordingHandler::default());
        let receiver = receiver(&handler);
        let body = json!({ "type": "url_verification", "challenge": "abc123" }).to_string();
        let (timestamp, signature) = signed(body.as_bytes());

        let received = receiver
            .receive(
                InboundHttpRequest {
                    timestamp: Some(&timestamp),
                    signature: Some(&signature),
                    content_type: Some("application/json"),
                    body: body.as_bytes(),
                },
                NOW,
            )
            .expect("challenge should be answered");

        assert_eq!(received.ack, Acknowledgement::Challenge("abc123".to_owned()));
        assert!(!received.dispatched);
        assert_eq!(receiver.drain().await, 0);
    }

    #[tokio::test]
    async fn drain_waits_for_dispatches_still_running() {
        let handler = Arc::new(RecordingHandler::default());
        let receiver = Arc::new(receiver(&handler));
        let body = shortcut_body();
        let (timestamp, signature) = signed(&body);

        let received = receiver
            .receive(
                InboundHttpRequest {
                    timestamp: Some(&timestamp),
                    signature: Some(&signature),
                    content_type: Some("application/x-www-form-urlencoded"),
                    body: &body,
                },
                NOW,
            )
            .expect("signed request should be accepted");
        assert!(received.dispatched);

        let draining = tokio::spawn({
            let receiver = Arc::clone(&receiver);
            async move { receiver.drain().await }
        });
        tokio::task::yield_now().await;
        assert!(!draining.is_finished(), "drain should wait for the blocked handler");
        assert!(handler.seen.lock().await.is_empty());

        handler.release.notify_one();
        let drained = draining.await.expect("drain task should finish");

        assert_eq!(drained, 1);
        assert_eq!(handler.seen.lock().await.len(), 1);
        assert_eq!(receiver.drain().await, 0, "nothing is left after a drain");
    }
}
