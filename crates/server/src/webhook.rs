use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use tally_slack::receiver::{Acknowledgement, InboundHttpRequest, InteractionReceiver, ReceiveError};
use tally_slack::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};

#[derive(Clone)]
pub struct WebhookState {
    receiver: Arc<InteractionReceiver>,
}

pub fn router(events_path: &str, receiver: Arc<InteractionReceiver>) -> Router {
    Router::new().route(events_path, post(receive_events)).with_state(WebhookState { receiver })
}

/// Slack's request URL. Answers as soon as the request is verified and parsed;
/// the shortcut itself runs in the background.
pub async fn receive_events(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let request = InboundHttpRequest {
        timestamp: header(TIMESTAMP_HEADER),
        signature: header(SIGNATURE_HEADER),
        content_type: header(CONTENT_TYPE.as_str()),
        body: &body,
    };

    match state.receiver.receive(request, Utc::now().timestamp()) {
        Ok(received) => match received.ack {
            Acknowledgement::Empty => StatusCode::OK.into_response(),
            Acknowledgement::Challenge(challenge) => (StatusCode::OK, challenge).into_response(),
        },
        Err(ReceiveError::Signature(_)) => StatusCode::UNAUTHORIZED.into_response(),
        Err(ReceiveError::Payload(_)) => StatusCode::BAD_REQUEST.into_response(),
    }
}
