//! Cross-process event fanout.
//!
//! Every process publishes state changes on one shared backend channel and
//! every process, the publisher included, relays what it hears to its own
//! WebSocket clients through a local broadcast hub. Delivery is best-effort:
//! a process that is not subscribed when an event goes out never sees it.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{SharedBackend, StoreError};

/// Backend channel shared by all processes
pub const EVENTS_CHANNEL: &str = "shipwreck:ws:events";

/// Capacity of the local hub; slow sockets lag and skip rather than block
const LOCAL_CAPACITY: usize = 256;

/// What travels on the shared channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: String,
    pub destination: String,
    pub payload: serde_json::Value,
}

pub struct EventFanout {
    instance_id: String,
    backend: Arc<dyn SharedBackend>,
    local: broadcast::Sender<Arc<Envelope>>,
}

impl EventFanout {
    pub fn new(instance_id: impl Into<String>, backend: Arc<dyn SharedBackend>) -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            backend,
            local,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publishes `payload` to `destination` on every process. Failures are
    /// logged and swallowed.
    pub async fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) {
        let envelope = match serde_json::to_value(payload) {
            Ok(payload) => Envelope {
                source_id: self.instance_id.clone(),
                destination: destination.to_string(),
                payload,
            },
            Err(e) => {
                warn!(destination, error = %e, "Failed to encode event payload");
                return;
            }
        };

        let raw = match serde_json::to_vec(&envelope) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                warn!(destination, error = %e, "Failed to encode event envelope");
                return;
            }
        };

        match self.backend.publish(EVENTS_CHANNEL, raw).await {
            Ok(receivers) => debug!(destination, receivers, "Event published"),
            Err(e) => warn!(destination, error = %e, "Failed to publish event"),
        }
    }

    /// Subscribes to the shared channel, then relays into the local hub
    /// until the channel closes.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, StoreError> {
        let mut incoming = self.backend.subscribe(EVENTS_CHANNEL).await?;
        let fanout = Arc::clone(self);

        info!(instance_id = %self.instance_id, channel = EVENTS_CHANNEL, "Event relay started");

        Ok(tokio::spawn(async move {
            while let Some(raw) = incoming.next().await {
                let envelope: Envelope = match serde_json::from_slice(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed event");
                        continue;
                    }
                };
                // No local clients is fine
                let _ = fanout.local.send(Arc::new(envelope));
            }
            info!(instance_id = %fanout.instance_id, "Event relay stopped");
        }))
    }

    /// Events relayed to this process, for one local client
    pub fn subscribe_local(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.local.subscribe()
    }
}
