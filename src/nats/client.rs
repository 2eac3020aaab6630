//! NATS-backed event bus
//!
//! The first connect fails fast so startup can fall back to the local bus.
//! After that the client reconnects on its own; connection events are only
//! logged.

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{info, warn};

use super::bus::EventBus;
use crate::config::NatsArgs;
use crate::types::{HandoffError, Result};

const KEEPALIVE: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    pub async fn new(args: &NatsArgs, connection_name: &str) -> Result<Self> {
        let url = args.nats_url.as_str();
        info!(url, connection_name, "Connecting to NATS");

        let credentials = args.nats_user.clone().zip(args.nats_password.clone());
        let options = ConnectOptions::new()
            .name(connection_name)
            .ping_interval(KEEPALIVE)
            .connection_timeout(CONNECT_TIMEOUT)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connection up"),
                    Event::Disconnected => warn!("NATS connection lost, reconnecting"),
                    other => info!(event = %other, "NATS event"),
                }
            });
        let options = match credentials {
            Some((user, password)) => options.user_and_password(user, password),
            None => options,
        };

        let client = options
            .connect(url)
            .await
            .map_err(|e| HandoffError::Nats(format!("connect to {url}: {e}")))?;
        info!(url, "NATS ready");
        Ok(Self { client })
    }
}

#[async_trait]
impl EventBus for NatsClient {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|e| HandoffError::Nats(format!("publish to {subject}: {e}")))
    }
}
