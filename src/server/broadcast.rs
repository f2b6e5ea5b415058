//! Broadcast bus for dashboard fan-out
//!
//! One dispatcher task owns the client set; registrations, removals, and all
//! writes go through its command channel, so the set is never touched from
//! two tasks at once. Delivery is best-effort: a client whose queue is full
//! or whose socket died is evicted, never waited on.
//!
//! The client-connect hook is injected by `main` after the controller is
//! built, which keeps this module free of any controller types.

use crate::types::Broadcast;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue depth of the dispatcher command channel
const COMMAND_BUFFER: usize = 256;

/// Queue depth per connected client; slow clients are evicted when full
const CLIENT_BUFFER: usize = 64;

/// Produces the ordered seed messages a fresh client receives before
/// joining the live stream
pub type ConnectHook = Arc<dyn Fn() -> BoxFuture<'static, Vec<Broadcast>> + Send + Sync>;

enum BusCommand {
    Register {
        id: u64,
        sink: mpsc::Sender<String>,
    },
    Deregister {
        id: u64,
    },
    Publish(Broadcast),
    SetConnectHook(ConnectHook),
    Shutdown,
}

/// Cloneable handle to the dispatcher task
#[derive(Clone)]
pub struct BroadcastBus {
    tx: mpsc::Sender<BusCommand>,
    next_client_id: Arc<AtomicU64>,
}

impl BroadcastBus {
    /// Spawn the dispatcher and return its handle
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = tokio::spawn(dispatch(rx));
        (
            Self {
                tx,
                next_client_id: Arc::new(AtomicU64::new(1)),
            },
            handle,
        )
    }

    /// Queue a broadcast without blocking; dropped if the bus is saturated
    pub fn publish(&self, broadcast: Broadcast) {
        if let Err(e) = self.tx.try_send(BusCommand::Publish(broadcast)) {
            warn!(error = %e, "Broadcast dropped, bus saturated or closed");
        }
    }

    /// Register a client sink; seed messages are delivered before any live
    /// broadcast reaches the new client. Returns the client id.
    pub async fn register(&self, sink: mpsc::Sender<String>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(BusCommand::Register { id, sink }).await;
        id
    }

    pub async fn deregister(&self, id: u64) {
        let _ = self.tx.send(BusCommand::Deregister { id }).await;
    }

    /// Install the client-connect hook producing seed messages
    pub async fn set_connect_hook(&self, hook: ConnectHook) {
        let _ = self.tx.send(BusCommand::SetConnectHook(hook)).await;
    }

    /// Drain pending broadcasts, close every client, stop the dispatcher
    pub async fn shutdown(&self) {
        let _ = self.tx.send(BusCommand::Shutdown).await;
    }
}

async fn dispatch(mut rx: mpsc::Receiver<BusCommand>) {
    let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut connect_hook: Option<ConnectHook> = None;

    while let Some(command) = rx.recv().await {
        match command {
            BusCommand::Register { id, sink } => {
                if let Some(hook) = &connect_hook {
                    let seeds = hook().await;
                    debug!(client = id, seeds = seeds.len(), "Seeding new client");
                    let mut seed_failed = false;
                    for broadcast in seeds {
                        match serde_json::to_string(&broadcast) {
                            Ok(json) => {
                                if sink.send(json).await.is_err() {
                                    seed_failed = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize seed broadcast");
                            }
                        }
                    }
                    if seed_failed {
                        debug!(client = id, "Client disconnected during seeding");
                        continue;
                    }
                }
                clients.insert(id, sink);
                info!(client = id, clients = clients.len(), "Dashboard client connected");
            }
            BusCommand::Deregister { id } => {
                if clients.remove(&id).is_some() {
                    info!(client = id, clients = clients.len(), "Dashboard client disconnected");
                }
            }
            BusCommand::Publish(broadcast) => {
                let json = match serde_json::to_string(&broadcast) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(kind = %broadcast.kind, error = %e, "Failed to serialize broadcast");
                        continue;
                    }
                };
                clients.retain(|id, sink| match sink.try_send(json.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(client = id, error = %e, "Evicting unresponsive client");
                        false
                    }
                });
            }
            BusCommand::SetConnectHook(hook) => {
                connect_hook = Some(hook);
            }
            BusCommand::Shutdown => {
                info!(clients = clients.len(), "Broadcast bus shutting down");
                break;
            }
        }
    }
    // dropping the senders closes every per-client writer task
    clients.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::kind;

    fn test_broadcast(n: u32) -> Broadcast {
        Broadcast::new(kind::CLUSTER_STATUS, &n)
    }

    #[tokio::test]
    async fn test_publish_reaches_registered_client() {
        let (bus, handle) = BroadcastBus::start();
        let (sink, mut stream) = mpsc::channel(CLIENT_BUFFER);
        bus.register(sink).await;

        bus.publish(test_broadcast(7));
        let json = stream.recv().await.unwrap();
        assert!(json.contains("\"type\":\"clusterStatus\""));
        assert!(json.contains("\"data\":7"));

        bus.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_messages_precede_live_stream() {
        let (bus, handle) = BroadcastBus::start();
        bus.set_connect_hook(Arc::new(|| {
            Box::pin(async { vec![Broadcast::new(kind::CONFIG, &"seed")] })
        }))
        .await;

        let (sink, mut stream) = mpsc::channel(CLIENT_BUFFER);
        bus.register(sink).await;
        bus.publish(test_broadcast(1));

        let first = stream.recv().await.unwrap();
        assert!(first.contains("\"type\":\"config\""));
        let second = stream.recv().await.unwrap();
        assert!(second.contains("\"type\":\"clusterStatus\""));

        bus.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_client_is_evicted() {
        let (bus, handle) = BroadcastBus::start();
        let (sink, stream) = mpsc::channel(1);
        let id = bus.register(sink).await;
        drop(stream);

        // first publish after the drop evicts the client
        bus.publish(test_broadcast(1));
        bus.deregister(id).await;

        let (sink2, mut stream2) = mpsc::channel(CLIENT_BUFFER);
        bus.register(sink2).await;
        bus.publish(test_broadcast(2));
        assert!(stream2.recv().await.unwrap().contains("\"data\":2"));

        bus.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let (bus, handle) = BroadcastBus::start();
        bus.shutdown().await;
        handle.await.unwrap();
    }
}
