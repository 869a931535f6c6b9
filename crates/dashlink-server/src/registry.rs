//! Connected-client registry and per-client delivery queues.
//!
//! The registry is the only structure touched by multiple threads: the
//! accept thread inserts, each connection thread removes itself, and any
//! thread may queue messages or iterate it for a broadcast or shutdown.
//!
//! Each client's outbound queue is an unbounded channel: any number of
//! producers enqueue, only that client's own connection loop drains, and
//! enqueue order per client is preserved.

use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use dashlink_proto::PanelMessage;

/// Opaque handle identifying one accepted panel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Per-client state held by the registry.
///
/// `should_close`, once set, is never cleared; the owning connection loop
/// observes it and tears the connection down.
struct ClientState {
    outbound_tx: Sender<PanelMessage>,
    outbound_rx: Receiver<PanelMessage>,
    writer: Arc<Mutex<TcpStream>>,
    should_close: Arc<AtomicBool>,
}

/// Consumer-side handle for one client, used only by its own connection
/// loop: the queue receiver, the close flag, and the shared write half of
/// the socket.
pub(crate) struct ClientHandle {
    pub(crate) outbound_rx: Receiver<PanelMessage>,
    pub(crate) should_close: Arc<AtomicBool>,
    pub(crate) writer: Arc<Mutex<TcpStream>>,
}

/// Concurrency-safe map from client handle to per-client state.
pub(crate) struct ClientRegistry {
    clients: RwLock<FxHashMap<ClientId, ClientState>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub(crate) fn new() -> ClientRegistry {
        ClientRegistry {
            clients: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted connection and allocate its id.
    ///
    /// `writer` is the shared write half of the socket, used by the
    /// connection loop for frames and by `stop()` for the close notice.
    pub(crate) fn register(&self, writer: Arc<Mutex<TcpStream>>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = unbounded();
        self.clients.write().insert(
            id,
            ClientState {
                outbound_tx,
                outbound_rx,
                writer,
                should_close: Arc::new(AtomicBool::new(false)),
            },
        );
        id
    }

    /// Remove a client. Dropping its state disconnects the queue senders.
    pub(crate) fn remove(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    /// The consumer handle for one client's connection loop.
    pub(crate) fn handle(&self, id: ClientId) -> Option<ClientHandle> {
        self.clients.read().get(&id).map(|state| ClientHandle {
            outbound_rx: state.outbound_rx.clone(),
            should_close: Arc::clone(&state.should_close),
            writer: Arc::clone(&state.writer),
        })
    }

    /// Queue a message for one client. Returns false when the client is no
    /// longer registered, in which case the message is dropped.
    pub(crate) fn queue(&self, id: ClientId, message: PanelMessage) -> bool {
        match self.clients.read().get(&id) {
            Some(state) => {
                let _ = state.outbound_tx.send(message);
                true
            }
            None => false,
        }
    }

    /// Queue a message exactly once for every currently-registered client.
    pub(crate) fn broadcast(&self, message: PanelMessage) {
        for state in self.clients.read().values() {
            let _ = state.outbound_tx.send(message.clone());
        }
    }

    /// Snapshot of the registered writers, for shutdown notification.
    pub(crate) fn writers(&self) -> Vec<(ClientId, Arc<Mutex<TcpStream>>)> {
        self.clients
            .read()
            .iter()
            .map(|(id, state)| (*id, Arc::clone(&state.writer)))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.clients.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashlink_proto::ResourceRef;
    use std::net::TcpListener;

    /// A registered writer needs a real socket; keep the peer alive so the
    /// stream stays open for the duration of the test.
    fn test_writer() -> (Arc<Mutex<TcpStream>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(Mutex::new(server)), peer)
    }

    fn play(path: &str) -> PanelMessage {
        PanelMessage::PlaySequence(ResourceRef {
            resource_path: path.to_string(),
        })
    }

    #[test]
    fn test_register_then_remove() {
        let registry = ClientRegistry::new();
        let (writer, _peer) = test_writer();
        let id = registry.register(writer);
        assert_eq!(registry.len(), 1);
        assert!(registry.handle(id).is_some());

        registry.remove(id);
        assert_eq!(registry.len(), 0);
        assert!(registry.handle(id).is_none());
    }

    #[test]
    fn test_queue_preserves_fifo_order() {
        let registry = ClientRegistry::new();
        let (writer, _peer) = test_writer();
        let id = registry.register(writer);

        assert!(registry.queue(id, play("/seq/first.json")));
        assert!(registry.queue(id, play("/seq/second.json")));
        assert!(registry.queue(id, PanelMessage::Pong));

        let handle = registry.handle(id).unwrap();
        assert_eq!(handle.outbound_rx.try_recv().unwrap(), play("/seq/first.json"));
        assert_eq!(handle.outbound_rx.try_recv().unwrap(), play("/seq/second.json"));
        assert_eq!(handle.outbound_rx.try_recv().unwrap(), PanelMessage::Pong);
        assert!(handle.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_to_unknown_client_is_dropped() {
        let registry = ClientRegistry::new();
        let (writer, _peer) = test_writer();
        let id = registry.register(writer);
        registry.remove(id);
        assert!(!registry.queue(id, PanelMessage::Pong));
    }

    #[test]
    fn test_broadcast_reaches_each_registered_client_once() {
        let registry = ClientRegistry::new();
        let (writer_a, _peer_a) = test_writer();
        let (writer_b, _peer_b) = test_writer();
        let (writer_c, _peer_c) = test_writer();
        let a = registry.register(writer_a);
        let b = registry.register(writer_b);
        let c = registry.register(writer_c);

        // A client gone before the broadcast must receive nothing.
        let gone = registry.handle(c).unwrap();
        registry.remove(c);

        registry.broadcast(PanelMessage::CloseConnection);

        for id in [a, b] {
            let handle = registry.handle(id).unwrap();
            assert_eq!(
                handle.outbound_rx.try_recv().unwrap(),
                PanelMessage::CloseConnection
            );
            assert!(
                handle.outbound_rx.try_recv().is_err(),
                "{} should get the broadcast exactly once",
                id
            );
        }
        assert!(gone.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn test_removed_client_disconnects_its_queue() {
        let registry = ClientRegistry::new();
        let (writer, _peer) = test_writer();
        let id = registry.register(writer);
        let handle = registry.handle(id).unwrap();

        registry.remove(id);
        // The sender side dropped with the state: the consumer sees a
        // disconnected, empty channel rather than hanging.
        assert!(handle.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_registration_yields_unique_ids() {
        let registry = Arc::new(ClientRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let (writer, peer) = test_writer();
                    let id = registry.register(writer);
                    // Keep the peer alive until the id is returned.
                    drop(peer);
                    id
                })
            })
            .collect();

        let mut ids: Vec<ClientId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "every registration must get a distinct id");
        assert_eq!(registry.len(), 8);
    }
}
