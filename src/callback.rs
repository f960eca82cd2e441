//! Client-visible events and the per-client callback executor (§4.4, §5,
//! §6.1).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::endpoint::{EndpointId, EndpointInfo};
use crate::options::Medium;
use crate::payload::{PayloadProgress, ReceivedPayload};
use crate::status::Status;

/// Depth of a client's event queue. The executor backpressures event
/// *delivery* at this bound; it never blocks the engine tasks that produce
/// events, since every producer sends with `try_send`-on-full semantics via
/// [`ClientCallbackExecutor::send`] (best-effort, logged on drop).
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Every notification the engine raises to a client, collapsed into one sum
/// type rather than the source's dynamically-typed callback signatures
/// (§9).
#[derive(Debug)]
pub enum Event {
    EndpointFound { endpoint_id: EndpointId, endpoint_name: EndpointInfo, service_id: String },
    EndpointLost { endpoint_id: EndpointId },
    Initiated { endpoint_id: EndpointId, auth_token: String },
    Accepted { endpoint_id: EndpointId },
    Rejected { endpoint_id: EndpointId, status: Status },
    Disconnected { endpoint_id: EndpointId },
    BandwidthChanged { endpoint_id: EndpointId, medium: Medium },
    PayloadReceived { endpoint_id: EndpointId, payload: ReceivedPayload },
    PayloadProgress { endpoint_id: EndpointId, progress: PayloadProgress },
}

/// A client's connection-lifecycle callbacks (§4.4, §6.1). Default bodies
/// are no-ops so a client only overrides the events it cares about.
pub trait ConnectionLifecycleListener: Send + Sync {
    fn on_initiated(&self, _endpoint_id: EndpointId, _auth_token: &str) {}
    fn on_accepted(&self, _endpoint_id: EndpointId) {}
    fn on_rejected(&self, _endpoint_id: EndpointId, _status: Status) {}
    fn on_disconnected(&self, _endpoint_id: EndpointId) {}
    fn on_bandwidth_changed(&self, _endpoint_id: EndpointId, _medium: Medium) {}
}

/// A client's discovery callbacks.
pub trait DiscoveryListener: Send + Sync {
    fn on_endpoint_found(&self, _endpoint_id: EndpointId, _endpoint_name: &EndpointInfo, _service_id: &str) {}
    fn on_endpoint_lost(&self, _endpoint_id: EndpointId) {}
}

/// A client's payload callbacks, supplied at `acceptConnection` time.
pub trait PayloadListener: Send + Sync {
    fn on_payload_received(&self, _endpoint_id: EndpointId, _payload: ReceivedPayload) {}
    fn on_payload_progress(&self, _endpoint_id: EndpointId, _progress: PayloadProgress) {}
}

#[derive(Default)]
struct Listeners {
    connection: Option<Box<dyn ConnectionLifecycleListener>>,
    discovery: Option<Box<dyn DiscoveryListener>>,
    payload: Option<Box<dyn PayloadListener>>,
}

/// One client's event queue plus the task draining it (§5: "client
/// callback executor"). Listener callbacks for a single endpoint are
/// invoked in strict causal order because they all flow through this one
/// queue (§4.4).
pub struct ClientCallbackExecutor {
    sender: mpsc::Sender<Event>,
    listeners: Arc<AsyncMutex<Listeners>>,
}

impl ClientCallbackExecutor {
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let listeners = Arc::new(AsyncMutex::new(Listeners::default()));
        let dispatch_listeners = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                dispatch(&dispatch_listeners, event).await;
            }
        });
        Self { sender, listeners }
    }

    /// A cloneable handle other subsystems (endpoint manager, payload
    /// manager, PCP controller) use to enqueue events for this client.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    pub async fn set_connection_listener(&self, listener: Box<dyn ConnectionLifecycleListener>) {
        self.listeners.lock().await.connection = Some(listener);
    }

    pub async fn set_discovery_listener(&self, listener: Box<dyn DiscoveryListener>) {
        self.listeners.lock().await.discovery = Some(listener);
    }

    pub async fn set_payload_listener(&self, listener: Box<dyn PayloadListener>) {
        self.listeners.lock().await.payload = Some(listener);
    }

    /// Enqueues one event. Silently dropped if the client's queue has been
    /// torn down (matching "slow/gone client code never blocks the
    /// engine").
    pub async fn send(&self, event: Event) {
        let _ = self.sender.send(event).await;
    }
}

impl std::fmt::Debug for ClientCallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCallbackExecutor").finish_non_exhaustive()
    }
}

async fn dispatch(listeners: &AsyncMutex<Listeners>, event: Event) {
    let listeners = listeners.lock().await;
    match event {
        Event::EndpointFound { endpoint_id, endpoint_name, service_id } => {
            if let Some(l) = &listeners.discovery {
                l.on_endpoint_found(endpoint_id, &endpoint_name, &service_id);
            }
        }
        Event::EndpointLost { endpoint_id } => {
            if let Some(l) = &listeners.discovery {
                l.on_endpoint_lost(endpoint_id);
            }
        }
        Event::Initiated { endpoint_id, auth_token } => {
            if let Some(l) = &listeners.connection {
                l.on_initiated(endpoint_id, &auth_token);
            }
        }
        Event::Accepted { endpoint_id } => {
            if let Some(l) = &listeners.connection {
                l.on_accepted(endpoint_id);
            }
        }
        Event::Rejected { endpoint_id, status } => {
            if let Some(l) = &listeners.connection {
                l.on_rejected(endpoint_id, status);
            }
        }
        Event::Disconnected { endpoint_id } => {
            if let Some(l) = &listeners.connection {
                l.on_disconnected(endpoint_id);
            }
        }
        Event::BandwidthChanged { endpoint_id, medium } => {
            if let Some(l) = &listeners.connection {
                l.on_bandwidth_changed(endpoint_id, medium);
            }
        }
        Event::PayloadReceived { endpoint_id, payload } => {
            if let Some(l) = &listeners.payload {
                l.on_payload_received(endpoint_id, payload);
            }
        }
        Event::PayloadProgress { endpoint_id, progress } => {
            if let Some(l) = &listeners.payload {
                l.on_payload_progress(endpoint_id, progress);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingListener {
        accepted: Arc<AtomicBool>,
    }

    impl ConnectionLifecycleListener for RecordingListener {
        fn on_accepted(&self, _endpoint_id: EndpointId) {
            self.accepted.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn events_reach_the_registered_listener() {
        let executor = ClientCallbackExecutor::spawn();
        let accepted = Arc::new(AtomicBool::new(false));
        executor.set_connection_listener(Box::new(RecordingListener { accepted: Arc::clone(&accepted) })).await;

        let endpoint_id = EndpointId::from_bytes(*b"ABCD");
        executor.send(Event::Accepted { endpoint_id }).await;

        for _ in 0..50 {
            if accepted.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(accepted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn events_with_no_listener_registered_are_dropped_silently() {
        let executor = ClientCallbackExecutor::spawn();
        executor.send(Event::Disconnected { endpoint_id: EndpointId::from_bytes(*b"WXYZ") }).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
