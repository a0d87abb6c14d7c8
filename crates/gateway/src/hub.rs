//! Registry of connected socket clients and broadcast fan-out.
//!
//! The [`Hub`] task owns the registry outright; everything else talks to it
//! through a cloneable [`HubHandle`]. Commands are applied one at a time in
//! arrival order, so a broadcast never observes a half-applied register or
//! unregister.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use {
    bytes::Bytes,
    tokio::sync::mpsc::{self, error::TrySendError},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use potat_metrics::{counter, gauge, names};
use potat_protocol::{Envelope, ProtocolError};

pub type ClientId = u64;

/// What the hub keeps per client: its id, the sending half of its bounded
/// outbound queue, and a token the hub cancels when it drops the client.
/// Dropping the sender closes the queue; cancelling `evict` tells the writer
/// to close right away instead of draining what is still queued.
#[derive(Debug)]
pub struct ClientRegistration {
    pub id: ClientId,
    pub queue: mpsc::Sender<Bytes>,
    pub evict: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum HubCommand {
    Register(ClientRegistration),
    Unregister(ClientId),
    Broadcast(Bytes),
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    clients: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, registration: ClientRegistration) {
        self.submit(HubCommand::Register(registration));
    }

    /// Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        self.submit(HubCommand::Unregister(id));
    }

    /// Queue `payload` for every client registered before it. Returns
    /// immediately.
    pub fn broadcast(&self, payload: Bytes) {
        self.submit(HubCommand::Broadcast(payload));
    }

    pub fn broadcast_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.broadcast(Bytes::from(envelope.to_json()?));
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    fn submit(&self, command: HubCommand) {
        if self.commands.send(command).is_err() {
            debug!("hub stopped, dropping command");
        }
    }
}

// ── Hub task ─────────────────────────────────────────────────────────────────

pub struct Hub {
    commands: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<ClientId, ClientRegistration>,
    count: Arc<AtomicUsize>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let hub = Self {
            commands: rx,
            clients: HashMap::new(),
            count: Arc::clone(&count),
        };
        let handle = HubHandle {
            commands: tx,
            clients: count,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        (hub, handle)
    }

    /// Apply commands until `shutdown` fires or every handle is dropped,
    /// then evict every remaining client.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }
        let remaining = self.clients.len();
        for (_, client) in self.clients.drain() {
            client.evict.cancel();
        }
        self.publish_count();
        info!(remaining, "hub stopped");
    }

    pub(crate) fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(registration) => {
                debug!(client_id = registration.id, "client registered");
                self.clients.insert(registration.id, registration);
            },
            HubCommand::Unregister(id) => {
                if self.clients.remove(&id).is_some() {
                    debug!(client_id = id, "client unregistered");
                }
            },
            HubCommand::Broadcast(payload) => self.fan_out(payload),
        }
        self.publish_count();
    }

    fn fan_out(&mut self, payload: Bytes) {
        if self.clients.is_empty() {
            return;
        }
        #[cfg(feature = "metrics")]
        counter!(names::SOCKET_BROADCASTS_TOTAL).increment(1);

        let mut dead = Vec::new();
        for (id, client) in &self.clients {
            match client.queue.try_send(payload.clone()) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    warn!(client_id = id, "send queue full, dropping client");
                    dead.push(*id);
                },
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            if let Some(client) = self.clients.remove(&id) {
                client.evict.cancel();
            }
            #[cfg(feature = "metrics")]
            counter!(names::SOCKET_DROPPED_CLIENTS_TOTAL).increment(1);
        }
    }

    fn publish_count(&self) {
        self.count.store(self.clients.len(), Ordering::Release);
        #[cfg(feature = "metrics")]
        gauge!(names::SOCKET_CONNECTIONS).set(self.clients.len() as f64);
    }

    #[cfg(test)]
    pub(crate) fn drain_commands(&mut self) -> Vec<HubCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            out.push(command);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Registered {
        id: ClientId,
        rx: mpsc::Receiver<Bytes>,
        evict: CancellationToken,
    }

    fn register(hub: &mut Hub, handle: &HubHandle, capacity: usize) -> Registered {
        let (queue, rx) = mpsc::channel(capacity);
        let id = handle.next_client_id();
        let evict = CancellationToken::new();
        hub.apply(HubCommand::Register(ClientRegistration {
            id,
            queue,
            evict: evict.clone(),
        }));
        Registered { id, rx, evict }
    }

    #[test]
    fn broadcast_reaches_every_client_in_order() {
        let (mut hub, handle) = Hub::new();
        let mut a = register(&mut hub, &handle, 8);
        let mut b = register(&mut hub, &handle, 8);

        hub.apply(HubCommand::Broadcast(Bytes::from_static(b"one")));
        hub.apply(HubCommand::Broadcast(Bytes::from_static(b"two")));

        for client in [&mut a, &mut b] {
            assert_eq!(client.rx.try_recv().unwrap(), Bytes::from_static(b"one"));
            assert_eq!(client.rx.try_recv().unwrap(), Bytes::from_static(b"two"));
            assert!(!client.evict.is_cancelled());
        }
    }

    #[test]
    fn full_queue_drops_only_the_slow_client() {
        let (mut hub, handle) = Hub::new();
        let mut slow = register(&mut hub, &handle, 1);
        let mut fast = register(&mut hub, &handle, 8);

        hub.apply(HubCommand::Broadcast(Bytes::from_static(b"one")));
        hub.apply(HubCommand::Broadcast(Bytes::from_static(b"two")));

        assert_eq!(handle.client_count(), 1);
        assert!(!hub.clients.contains_key(&slow.id));
        assert!(slow.evict.is_cancelled());
        assert!(!fast.evict.is_cancelled());
        assert_eq!(slow.rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert!(matches!(
            slow.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(fast.rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(fast.rx.try_recv().unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn unregister_closes_queue_and_ignores_unknown_ids() {
        let (mut hub, handle) = Hub::new();
        let mut client = register(&mut hub, &handle, 8);

        hub.apply(HubCommand::Unregister(client.id));
        hub.apply(HubCommand::Unregister(client.id));
        hub.apply(HubCommand::Unregister(9999));

        assert_eq!(handle.client_count(), 0);
        assert!(matches!(
            client.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn broadcast_before_register_is_not_replayed() {
        let (mut hub, handle) = Hub::new();
        hub.apply(HubCommand::Broadcast(Bytes::from_static(b"nobody")));
        let mut late = register(&mut hub, &handle, 8);

        assert!(matches!(
            late.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn broadcast_right_after_register_is_delivered() {
        let (hub, handle) = Hub::new();
        let (queue, mut rx) = mpsc::channel(8);
        handle.register(ClientRegistration {
            id: handle.next_client_id(),
            queue,
            evict: CancellationToken::new(),
        });
        handle.broadcast(Bytes::from_static(b"first relay"));
        assert_eq!(handle.client_count(), 0);

        let shutdown = CancellationToken::new();
        tokio::spawn(hub.run(shutdown.clone()));
        let first = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(Bytes::from_static(b"first relay")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_closes_remaining_queues() {
        let (hub, handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(hub.run(shutdown.clone()));

        let (queue, mut rx) = mpsc::channel(8);
        let evict = CancellationToken::new();
        handle.register(ClientRegistration {
            id: handle.next_client_id(),
            queue,
            evict: evict.clone(),
        });
        while handle.client_count() == 0 {
            tokio::task::yield_now().await;
        }
        handle.broadcast(Bytes::from_static(b"hello"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        shutdown.cancel();
        task.await.unwrap();
        assert!(evict.is_cancelled());
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.client_count(), 0);
    }
}
