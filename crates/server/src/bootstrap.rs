use std::sync::Arc;

use tally_core::config::AppConfig;
use tally_slack::api::{HttpSlackClient, SlackApiError, SlackWebApi};
use tally_slack::events::EventDispatcher;
use tally_slack::receiver::InteractionReceiver;
use tally_slack::shortcut::ReactionCountHandler;
use tally_slack::signature::SignatureVerifier;
use thiserror::Error;
use tracing::info;

/// Everything a running server needs, built once at startup.
pub struct Application {
    pub config: AppConfig,
    pub receiver: Arc<InteractionReceiver>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("slack client could not be created: {0}")]
    SlackClient(#[source] SlackApiError),
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let client =
        HttpSlackClient::from_config(&config.slack).map_err(BootstrapError::SlackClient)?;
    info!(
        event_name = "system.bootstrap.slack_client_ready",
        correlation_id = "bootstrap",
        api_base_url = %config.slack.api_base_url,
        "slack web api client ready"
    );

    Ok(assemble(config, Arc::new(client)))
}

/// Wires the receiver, dispatcher and shortcut handler around `slack_api`.
pub fn assemble(config: AppConfig, slack_api: Arc<dyn SlackWebApi>) -> Application {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(ReactionCountHandler::new(
        slack_api,
        config.slack.shortcut_callback_id.clone(),
    ));

    let verifier = SignatureVerifier::new(
        config.slack.signing_secret.clone(),
        config.server.signature_max_age_secs,
    );
    let receiver = InteractionReceiver::new(verifier, dispatcher, config.logging.request_dump);

    info!(
        event_name = "system.bootstrap.receiver_ready",
        correlation_id = "bootstrap",
        events_path = %config.server.events_path,
        shortcut_callback_id = %config.slack.shortcut_callback_id,
        request_dump = config.logging.request_dump,
        "slack receiver ready"
    );

    Application { config, receiver: Arc::new(receiver) }
}
