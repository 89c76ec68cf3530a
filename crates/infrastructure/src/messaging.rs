//! Event intake from the NATS bus.
//!
//! A single consumer task merges the four channel subscriptions, decodes
//! each JSON payload, and dispatches synchronously into the handler.
//! Undecodable messages are logged and dropped; handler errors are logged
//! and the loop keeps consuming.

use std::sync::Arc;

use async_nats::{Client, ConnectOptions};
use futures::stream::{select_all, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use warmpool_domain::events::EventHandler;
use warmpool_shared::config::EventBusConfig;
use warmpool_shared::event_topics;

/// Establishes the bus connection. A failure here is fatal at startup.
pub async fn connect(config: &EventBusConfig) -> Result<Client, async_nats::ConnectError> {
    let mut options = ConnectOptions::new().name("warmpool-server");
    if let (Some(user), Some(password)) = (config.user.clone(), config.password.clone()) {
        options = options.user_and_password(user, password);
    }

    let client = options.connect(&config.url).await?;
    info!(url = %config.url, "connected to event bus");
    Ok(client)
}

/// Consumes the four event channels and feeds the handler.
pub struct EventSubscriber {
    client: Client,
    handler: Arc<dyn EventHandler>,
}

impl EventSubscriber {
    pub fn new(client: Client, handler: Arc<dyn EventHandler>) -> Self {
        Self { client, handler }
    }

    /// Subscribes and consumes until the shutdown signal flips or the
    /// connection closes. The message in flight is always finished.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), async_nats::SubscribeError> {
        let mut subscriptions = Vec::with_capacity(event_topics::CHANNELS.len());
        for channel in event_topics::CHANNELS {
            subscriptions.push(self.client.subscribe(channel).await?);
        }
        info!(channels = ?event_topics::CHANNELS, "subscribed to event channels");

        let mut messages = select_all(subscriptions);

        loop {
            tokio::select! {
                next = messages.next() => {
                    match next {
                        Some(message) => {
                            dispatch(
                                self.handler.as_ref(),
                                message.subject.as_str(),
                                &message.payload,
                            )
                            .await;
                        }
                        None => {
                            warn!("event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("event intake stopping");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Routes one raw message to its handler by channel name.
async fn dispatch(handler: &dyn EventHandler, channel: &str, payload: &[u8]) {
    debug!(channel, len = payload.len(), "received message");

    let outcome = match channel {
        event_topics::USER_ACTIVITY => {
            let Some(event) = decode(channel, payload) else {
                return;
            };
            handler.handle_user_activity(event).await
        }
        event_topics::USER_CONNECT => {
            let Some(event) = decode(channel, payload) else {
                return;
            };
            handler.handle_user_connect(event).await
        }
        event_topics::USER_DISCONNECT => {
            let Some(event) = decode(channel, payload) else {
                return;
            };
            handler.handle_user_disconnect(event).await
        }
        event_topics::NODE_STATUS => {
            let Some(event) = decode(channel, payload) else {
                return;
            };
            handler.handle_node_status(event).await
        }
        _ => {
            warn!(channel, "message on unknown channel");
            return;
        }
    };

    if let Err(err) = outcome {
        error!(channel, error = %err, "failed to handle message");
    }
}

fn decode<T: DeserializeOwned>(channel: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(channel, error = %err, "dropping undecodable message");
            None
        }
    }
}
