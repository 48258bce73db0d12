use axum::{routing::get, Router};

pub const LIVENESS_BODY: &str = "Your Bolt \u{26a1}\u{fe0f} App is running!";

/// Unauthenticated liveness probe on `/`. Never touches Slack.
pub fn router() -> Router {
    Router::new().route("/", get(liveness))
}

pub async fn liveness() -> &'static str {
    LIVENESS_BODY
}
