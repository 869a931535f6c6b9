//! The panel server: accept loop, per-connection loops, and the facade the
//! host application embeds.
//!
//! Concurrency model: one accept thread plus one thread per connected
//! panel, all blocking I/O with a short fixed idle poll as cooperative
//! backoff. Each connection iteration drains its outbound queue before it
//! decodes at most one inbound frame, so queued messages go out in FIFO
//! order and are never starved by inbound traffic.
//!
//! ## Connection lifecycle
//!
//! ```text
//! PanelServer::start
//!     |
//!     v  accept thread (polled listener)
//! register in ClientRegistry, spawn connection thread
//!     |
//!     +-- AwaitingHandshake: poll try_handshake until upgraded
//!     +-- on_client_handshake subscribers fire
//!     +-- Upgraded: drain queue -> decode one frame -> dispatch
//!     +-- Closed: shutdown socket, remove from registry
//! ```
//!
//! Any I/O failure on one connection is caught and logged there; it never
//! reaches the other connections or the accept loop.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use dashlink_proto::PanelMessage;

use crate::error::{is_would_block, ServerError};
use crate::registry::{ClientHandle, ClientId, ClientRegistry};
use crate::ws::frame::{read_frame, write_frame, WsFrame, WsOpcode};
use crate::ws::handshake::{try_handshake, HandshakeStatus};

/// Fixed loopback port panels connect to.
pub const PANEL_PORT: u16 = 8085;

/// Cooperative backoff between polls of an idle connection or listener.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Collaborator hooks, multi-subscriber.
///
/// Subscribers receive the server handle so they can queue replies from
/// inside a callback. Callbacks run synchronously on the connection's own
/// thread; a panic in a callback takes down that connection's thread and
/// nothing else. The endpoint has no opinion on message semantics beyond
/// decode and dispatch.
pub trait PanelEvents: Send + Sync {
    /// A panel completed its WebSocket handshake.
    fn on_client_handshake(&self, _server: &PanelServer, _client: ClientId) {}

    /// A panel sent a message that decoded successfully.
    fn process_client_message(
        &self,
        _server: &PanelServer,
        _client: ClientId,
        _message: PanelMessage,
    ) {
    }
}

struct ServerInner {
    port: u16,
    registry: ClientRegistry,
    subscribers: RwLock<Vec<Arc<dyn PanelEvents>>>,
    running: AtomicBool,
    shutdown: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

/// The embedded panel endpoint.
///
/// Owns the listener, the client registry, and the cancellation signal.
/// Cheap to clone; every clone drives the same server, so the host can
/// hand handles to whatever subsystems need to queue messages.
#[derive(Clone)]
pub struct PanelServer {
    inner: Arc<ServerInner>,
}

impl PanelServer {
    /// A server on the standard panel port. Nothing is bound until
    /// [`start`](PanelServer::start).
    pub fn new() -> PanelServer {
        PanelServer::with_port(PANEL_PORT)
    }

    /// A server on a custom loopback port (port 0 picks one; see
    /// [`local_addr`](PanelServer::local_addr)).
    pub fn with_port(port: u16) -> PanelServer {
        PanelServer {
            inner: Arc::new(ServerInner {
                port,
                registry: ClientRegistry::new(),
                subscribers: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                bound_addr: Mutex::new(None),
                accept_handle: Mutex::new(None),
            }),
        }
    }

    /// Register a collaborator for handshake and message events.
    pub fn subscribe(&self, subscriber: Arc<dyn PanelEvents>) {
        self.inner.subscribers.write().push(subscriber);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.lock()
    }

    /// Number of currently-registered panel connections.
    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Bind the loopback listener and spawn the accept loop.
    ///
    /// Idempotent: calling `start` while running is a no-op and leaves the
    /// single existing listener in place.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.bind_and_spawn() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn bind_and_spawn(&self) -> Result<(), ServerError> {
        self.inner.shutdown.store(false, Ordering::SeqCst);
        let listener = TcpListener::bind(("127.0.0.1", self.inner.port))?;
        // Polled accept so the loop keeps observing the shutdown signal.
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.inner.bound_addr.lock() = Some(addr);
        info!("panel server listening on {}", addr);

        let server = self.clone();
        let handle = thread::Builder::new()
            .name("dashlink-accept".to_string())
            .spawn(move || server.accept_loop(listener))?;
        *self.inner.accept_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the server and close every panel connection.
    ///
    /// Best-effort order: a `CloseConnection` message is written straight
    /// through each client's shared writer (the connection loops are about
    /// to die, so their queues cannot be relied on to drain), then every
    /// socket is shut down, the registry is cleared, and the accept thread
    /// is signaled and joined. A no-op when not running.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            "stopping panel server ({} panels connected)",
            self.inner.registry.len()
        );

        let notice = PanelMessage::CloseConnection.to_json().ok();
        for (id, writer) in self.inner.registry.writers() {
            let mut stream = writer.lock();
            if let Some(text) = notice.as_deref() {
                if let Err(e) = write_frame(&mut *stream, WsOpcode::Text, text.as_bytes()) {
                    debug!("{}: close notice not delivered: {}", id, e);
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.inner.registry.clear();

        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.accept_handle.lock().take() {
            let _ = handle.join();
        }
        *self.inner.bound_addr.lock() = None;
        debug!("panel server stopped");
    }

    /// Queue a message for one panel, or for every panel when `client` is
    /// `None` (broadcast). Messages for clients no longer registered are
    /// silently dropped.
    pub fn queue_message(&self, message: PanelMessage, client: Option<ClientId>) {
        match client {
            Some(id) => {
                if !self.inner.registry.queue(id, message) {
                    debug!("{}: dropping message for unregistered client", id);
                }
            }
            None => self.inner.registry.broadcast(message),
        }
    }

    // -----------------------------------------------------------------
    // Accept loop
    // -----------------------------------------------------------------

    fn accept_loop(&self, listener: TcpListener) {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) || !self.is_running() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.launch_connection(stream, peer) {
                        error!("failed to launch connection for {}: {}", peer, e);
                    }
                }
                Err(e) if is_would_block(&e) => thread::sleep(IDLE_POLL),
                Err(e) => {
                    // A listener failure is fatal to the whole server.
                    if self.is_running() {
                        error!("listener failed, panel server is down: {}", e);
                        self.inner.running.store(false, Ordering::SeqCst);
                    }
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }

    fn launch_connection(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        // Accepted sockets may inherit the listener's non-blocking flag on
        // some platforms; connection I/O must be blocking with a bounded
        // read timeout, so the wait for inbound bytes doubles as the
        // connection loop's idle sleep.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(IDLE_POLL))?;
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let id = self.inner.registry.register(writer);
        debug!("{}: accepted panel connection from {}", id, peer);

        let server = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("dashlink-{}", id))
            .spawn(move || server.connection_loop(id, stream));
        if let Err(e) = spawned {
            self.inner.registry.remove(id);
            return Err(e);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Connection loop
    // -----------------------------------------------------------------

    fn connection_loop(&self, id: ClientId, mut stream: TcpStream) {
        let handle = match self.inner.registry.handle(id) {
            Some(handle) => handle,
            None => {
                // stop() raced the spawn and already cleared the registry.
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };

        if let Err(e) = self.run_connection(id, &mut stream, &handle) {
            debug!("{}: connection closed: {}", id, e);
        }

        let _ = stream.shutdown(Shutdown::Both);
        self.inner.registry.remove(id);
        debug!("{}: removed from registry", id);
    }

    /// Drive one connection from AwaitingHandshake through Upgraded until
    /// it closes. Returns `Err` only for transport failures; protocol
    /// problems are logged and survived.
    fn run_connection(
        &self,
        id: ClientId,
        stream: &mut TcpStream,
        handle: &ClientHandle,
    ) -> Result<(), ServerError> {
        // AwaitingHandshake. No timeout or retry cap: a socket that never
        // upgrades holds this thread until stop() force-closes it.
        loop {
            if self.halted(handle) {
                return Ok(());
            }
            match try_handshake(stream)? {
                HandshakeStatus::Complete => break,
                HandshakeStatus::Pending => thread::sleep(IDLE_POLL),
            }
        }
        debug!("{}: handshake complete", id);
        for subscriber in self.subscribers() {
            subscriber.on_client_handshake(self, id);
        }

        // Upgraded: send before receive, one inbound frame per iteration.
        loop {
            if self.halted(handle) {
                return Ok(());
            }

            while let Ok(message) = handle.outbound_rx.try_recv() {
                self.send_message(id, handle, &message)?;
            }

            match self.poll_inbound(stream)? {
                Inbound::Idle => continue, // the bounded peek was the idle wait
                Inbound::Eof => {
                    debug!("{}: peer disconnected", id);
                    return Ok(());
                }
                Inbound::Frame(frame) => self.dispatch_frame(id, handle, frame),
            }
        }
    }

    fn halted(&self, handle: &ClientHandle) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst) || handle.should_close.load(Ordering::SeqCst)
    }

    fn send_message(
        &self,
        id: ClientId,
        handle: &ClientHandle,
        message: &PanelMessage,
    ) -> Result<(), ServerError> {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                // The unit is bad, not the connection; drop it and move on.
                warn!("{}: failed to encode outbound message: {}", id, e);
                return Ok(());
            }
        };
        trace!("{}: sending {}", id, text);
        let mut writer = handle.writer.lock();
        write_frame(&mut *writer, WsOpcode::Text, text.as_bytes())
    }

    /// Poll for one inbound frame. The socket's bounded read timeout makes
    /// the no-data case wait out the idle interval before reporting
    /// [`Inbound::Idle`].
    fn poll_inbound(&self, stream: &mut TcpStream) -> Result<Inbound, ServerError> {
        let mut probe = [0u8; 1];
        match stream.peek(&mut probe) {
            Ok(0) => return Ok(Inbound::Eof),
            Ok(_) => {}
            Err(e) if is_would_block(&e) => return Ok(Inbound::Idle),
            Err(e) => return Err(e.into()),
        }

        // A complete frame is assumed readable once any byte is; lift the
        // poll timeout for the duration of the read.
        stream.set_read_timeout(None)?;
        let frame = read_frame(stream);
        stream.set_read_timeout(Some(IDLE_POLL))?;
        Ok(Inbound::Frame(frame?))
    }

    fn dispatch_frame(&self, id: ClientId, handle: &ClientHandle, frame: WsFrame) {
        match frame.opcode {
            WsOpcode::Text => {
                let text = match String::from_utf8(frame.payload) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("{}: dropping non-UTF-8 text frame: {}", id, e);
                        return;
                    }
                };
                match PanelMessage::from_json(&text) {
                    Ok(message) => {
                        trace!("{}: received {}", id, text);
                        for subscriber in self.subscribers() {
                            subscriber.process_client_message(self, id, message.clone());
                        }
                    }
                    Err(e) => warn!("{}: dropping undecodable message ({}): {}", id, e, text),
                }
            }
            WsOpcode::Close => {
                debug!("{}: close frame received", id);
                handle.should_close.store(true, Ordering::SeqCst);
            }
            other => debug!("{}: dropping unsupported {:?} frame", id, other),
        }
    }

    fn subscribers(&self) -> Vec<Arc<dyn PanelEvents>> {
        self.inner.subscribers.read().clone()
    }
}

impl Default for PanelServer {
    fn default() -> PanelServer {
        PanelServer::new()
    }
}

/// What one inbound poll produced.
enum Inbound {
    /// No data within the idle interval.
    Idle,
    /// The peer closed its end.
    Eof,
    /// One complete frame.
    Frame(WsFrame),
}
