//! Sync transport: a persistent duplex channel between one workspace and
//! the server.
//!
//! ```text
//! local edits ──► DocRegistry ──► dispatcher ──► ClientUpdate frames
//!                                    ▲  │
//!            ServerHandshake /       │  ▼
//!            ServerUpdate frames ────┘ apply (Origin::Remote)
//! ```
//!
//! One [`SyncConnection`] per workspace, constructed and torn down by the
//! caller — there is no process-wide socket or document map. All document,
//! awareness, and socket events funnel into a single dispatcher task's
//! `select!` loop: the registry and update cache are mutated from that
//! task only.
//!
//! State machine: `Disconnected → Connecting → Connected → Synced`, with
//! `Disconnecting` entered on purposeful teardown. `connect` is idempotent;
//! reconnect policy is the caller's problem.
//!
//! Updates arriving for documents that have not registered yet are
//! buffered and drained when the document registers; a low-frequency
//! timer re-drains as a safety net and is cancelled once the cache is
//! empty. Frames tolerate any relative order — the CRDT merge is
//! commutative and idempotent, so no sequence numbers exist anywhere.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use uuid::Uuid;

use crate::awareness::{Awareness, AwarenessEvent};
use crate::codec;
use crate::doc::{CrdtDoc, DocEvent, Origin};
use crate::protocol::{Frame, ProtocolError};
use crate::registry::DocRegistry;

/// Safety-net drain interval for the update cache.
const CACHE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// How long `disconnect` waits for the server to ack the awareness leave.
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not yet answered.
    Connected,
    /// First server handshake applied.
    Synced,
    Disconnecting,
}

/// One side of a frame-oriented duplex socket.
///
/// The websocket front end bridges to this shape; tests wire two of them
/// back to back with [`FrameSocket::pair`].
pub struct FrameSocket {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

impl FrameSocket {
    /// Two sockets connected back to back (in-process transport).
    pub fn pair() -> (FrameSocket, FrameSocket) {
        let (a_tx, a_rx) = mpsc::channel(256);
        let (b_tx, b_rx) = mpsc::channel(256);
        (
            FrameSocket {
                outgoing: a_tx,
                incoming: b_rx,
            },
            FrameSocket {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Bridge a websocket stream into a [`FrameSocket`].
///
/// Frames are bincode-encoded into binary messages. Undecodable inbound
/// messages are logged and dropped, never fatal.
pub fn ws_frame_socket<S>(ws: S) -> FrameSocket
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + Unpin
        + 'static,
{
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(256);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let encoded = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode outbound frame: {e}");
                    continue;
                }
            };
            if write.send(Message::Binary(encoded.into())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match Frame::decode(&bytes) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    FrameSocket {
        outgoing: out_tx,
        incoming: in_rx,
    }
}

/// Per-workspace sync connection.
pub struct SyncConnection {
    workspace_id: Uuid,
    root: Arc<dyn CrdtDoc>,
    awareness: Arc<RwLock<Awareness>>,
    state: Arc<RwLock<ConnectionState>>,
    connected_tx: Arc<watch::Sender<bool>>,
    connected_rx: watch::Receiver<bool>,
    synced_tx: Arc<watch::Sender<bool>>,
    synced_rx: watch::Receiver<bool>,
    leave_flushed: Arc<Notify>,
    shutdown: Arc<Notify>,
    started: bool,
    dispatcher: Option<JoinHandle<()>>,
    leave_flush_timeout: Duration,
}

impl SyncConnection {
    /// Create a connection for the workspace rooted at `root`. The root
    /// document's guid doubles as the workspace id.
    pub fn new(root: Arc<dyn CrdtDoc>, awareness: Awareness) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            workspace_id: root.guid(),
            root,
            awareness: Arc::new(RwLock::new(awareness)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connected_tx: Arc::new(connected_tx),
            connected_rx,
            synced_tx: Arc::new(synced_tx),
            synced_rx,
            leave_flushed: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            started: false,
            dispatcher: None,
            leave_flush_timeout: LEAVE_FLUSH_TIMEOUT,
        }
    }

    /// Shorten the leave-ack timeout (tests against mute servers).
    pub fn with_leave_flush_timeout(mut self, timeout: Duration) -> Self {
        self.leave_flush_timeout = timeout;
        self
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    /// Shared handle to this connection's awareness.
    pub fn awareness(&self) -> Arc<RwLock<Awareness>> {
        self.awareness.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Resolves once the socket is open and the handshake has been sent.
    pub async fn wait_for_connected(&self) {
        let mut rx = self.connected_rx.clone();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Resolves once the first server handshake has been applied.
    pub async fn wait_for_synced(&self) {
        let mut rx = self.synced_rx.clone();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Connect over an already-established frame socket.
    ///
    /// Idempotent: a second call while connecting or connected is a no-op.
    pub async fn connect(&mut self, socket: FrameSocket) -> Result<(), ProtocolError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        *self.state.write().await = ConnectionState::Connecting;

        // A frame socket is open by construction; announce ourselves and
        // ask peers for their awareness state.
        let hello = async {
            socket
                .outgoing
                .send(Frame::ClientHandshake {
                    workspace_id: self.workspace_id,
                })
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            socket
                .outgoing
                .send(Frame::InitAwareness {
                    workspace_id: self.workspace_id,
                })
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)
        };
        if let Err(e) = hello.await {
            // Leave the connection reusable for a retry on a fresh socket.
            self.started = false;
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        let (awareness_tx, awareness_events) = mpsc::unbounded_channel();
        self.awareness.write().await.subscribe(awareness_tx);

        let (mut registry, doc_events) = DocRegistry::new();
        registry.register(self.root.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.connected_tx.send(true);
        log::info!("Workspace {} connected", self.workspace_id);

        let dispatcher = Dispatcher {
            workspace_id: self.workspace_id,
            awareness: self.awareness.clone(),
            state: self.state.clone(),
            connected: self.connected_tx.clone(),
            synced: self.synced_tx.clone(),
            leave_flushed: self.leave_flushed.clone(),
            shutdown: self.shutdown.clone(),
            subdocs_handshaken: false,
            leave_pending: false,
        };
        self.dispatcher = Some(tokio::spawn(dispatcher.run(
            socket,
            registry,
            doc_events,
            awareness_events,
        )));
        Ok(())
    }

    /// Connect to a websocket sync server.
    pub async fn connect_ws(&mut self, url: &str) -> Result<(), ProtocolError> {
        if self.started {
            return Ok(());
        }
        let (ws_stream, _): (
            tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>,
            _,
        ) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.connect(ws_frame_socket(ws_stream)).await
    }

    /// Tear the connection down.
    ///
    /// Destroys local awareness first (which emits the removal of the
    /// local client), then waits for the server's ack of that removal
    /// before closing the socket, so other clients reliably see us leave.
    /// The root document is unregistered recursively by the dispatcher
    /// during teardown. Wait states are reset so the connection can be
    /// reused for a future `connect`.
    pub async fn disconnect(&mut self) {
        if !self.started {
            return;
        }
        *self.state.write().await = ConnectionState::Disconnecting;

        self.awareness.write().await.destroy();

        if tokio::time::timeout(self.leave_flush_timeout, self.leave_flushed.notified())
            .await
            .is_err()
        {
            log::warn!(
                "Workspace {}: no ack for awareness leave, closing anyway",
                self.workspace_id
            );
        }

        self.shutdown.notify_one();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.await;
        }

        self.started = false;
        let _ = self.connected_tx.send(false);
        let _ = self.synced_tx.send(false);
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Workspace {} disconnected", self.workspace_id);
    }
}

/// The single task that owns the registry and serializes all mutation.
struct Dispatcher {
    workspace_id: Uuid,
    awareness: Arc<RwLock<Awareness>>,
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<watch::Sender<bool>>,
    synced: Arc<watch::Sender<bool>>,
    leave_flushed: Arc<Notify>,
    shutdown: Arc<Notify>,
    /// Subdocument handshake happens once per connection.
    subdocs_handshaken: bool,
    /// An awareness update removing the local client is in flight.
    leave_pending: bool,
}

impl Dispatcher {
    async fn run(
        mut self,
        socket: FrameSocket,
        mut registry: DocRegistry,
        mut doc_events: mpsc::UnboundedReceiver<DocEvent>,
        mut awareness_events: mpsc::UnboundedReceiver<AwarenessEvent>,
    ) {
        let FrameSocket {
            outgoing,
            mut incoming,
        } = socket;
        let shutdown = self.shutdown.clone();
        let mut drain_timer: Option<tokio::time::Interval> = None;

        loop {
            tokio::select! {
                frame = incoming.recv() => {
                    match frame {
                        Some(frame) => {
                            if self
                                .handle_frame(frame, &outgoing, &mut registry)
                                .await
                                .is_err()
                            {
                                log::warn!("Workspace {}: send failed, socket gone", self.workspace_id);
                                break;
                            }
                        }
                        None => {
                            log::info!("Workspace {}: server closed the socket", self.workspace_id);
                            break;
                        }
                    }
                }

                Some(event) = doc_events.recv() => {
                    if self
                        .handle_doc_event(event, &outgoing, &mut registry)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                Some(event) = awareness_events.recv() => {
                    if self.handle_awareness_event(event, &outgoing).await.is_err() {
                        break;
                    }
                }

                // Safety-net drain; push-style drain already happened at
                // registration time.
                _ = async { drain_timer.as_mut().unwrap().tick().await }, if drain_timer.is_some() => {
                    registry.drain_ready();
                }

                _ = shutdown.notified() => {
                    break;
                }
            }

            match (registry.has_pending(), drain_timer.is_some()) {
                (true, false) => {
                    let mut interval = tokio::time::interval(CACHE_DRAIN_INTERVAL);
                    // First tick fires immediately; skip it.
                    interval.reset();
                    drain_timer = Some(interval);
                }
                (false, true) => drain_timer = None,
                _ => {}
            }
        }

        registry.unregister(self.workspace_id);
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.connected.send(false);
        let _ = self.synced.send(false);
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        outgoing: &mpsc::Sender<Frame>,
        registry: &mut DocRegistry,
    ) -> Result<(), ProtocolError> {
        match frame {
            Frame::ServerHandshake { guid, update } => {
                let bytes = match codec::decode_update(&update) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping malformed handshake for doc {guid}: {e}");
                        return Ok(());
                    }
                };
                match registry.get(guid) {
                    None => registry.buffer(guid, bytes),
                    Some(doc) => {
                        // Tell the server what it is missing: our state
                        // minus what it just sent.
                        match doc.encode_state_as_update(Some(&bytes)) {
                            Ok(diff) => self.send_doc_update(outgoing, guid, &diff).await?,
                            Err(e) => {
                                log::warn!("Cannot diff doc {guid} against handshake: {e}")
                            }
                        }

                        if !self.subdocs_handshaken {
                            self.subdoc_handshake(outgoing, &doc).await?;
                            self.subdocs_handshaken = true;
                        }

                        if let Err(e) = doc.apply_update(&bytes, Origin::Remote) {
                            log::warn!("Dropping undecodable handshake update for doc {guid}: {e}");
                        }

                        *self.state.write().await = ConnectionState::Synced;
                        let _ = self.synced.send(true);
                        log::debug!("Workspace {}: doc {guid} synced", self.workspace_id);
                    }
                }
            }

            Frame::ServerUpdate { guid, update } => {
                let bytes = match codec::decode_update(&update) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping malformed update for doc {guid}: {e}");
                        return Ok(());
                    }
                };
                match registry.get(guid) {
                    Some(doc) => {
                        if let Err(e) = doc.apply_update(&bytes, Origin::Remote) {
                            log::warn!("Dropping undecodable update for doc {guid}: {e}");
                        }
                    }
                    None => registry.buffer(guid, bytes),
                }
            }

            Frame::ServerAwarenessBroadcast {
                awareness_update, ..
            } => match codec::decode_update(&awareness_update) {
                Ok(bytes) => {
                    if let Err(e) = self
                        .awareness
                        .write()
                        .await
                        .apply_update(&bytes, Origin::Remote)
                    {
                        log::warn!("Dropping undecodable awareness broadcast: {e}");
                    }
                }
                Err(e) => log::warn!("Dropping malformed awareness broadcast: {e}"),
            },

            Frame::NewClientAwarenessInit => {
                // A new peer joined: re-broadcast our full local state.
                let update = {
                    let awareness = self.awareness.read().await;
                    awareness.encode_update(&[awareness.client_id()])
                };
                self.send_awareness_update(outgoing, update).await?;
            }

            Frame::AwarenessAck { .. } => {
                if self.leave_pending {
                    self.leave_pending = false;
                    self.leave_flushed.notify_one();
                }
            }

            other => {
                log::debug!("Ignoring unexpected frame: {other:?}");
            }
        }
        Ok(())
    }

    async fn handle_doc_event(
        &mut self,
        event: DocEvent,
        outgoing: &mpsc::Sender<Frame>,
        registry: &mut DocRegistry,
    ) -> Result<(), ProtocolError> {
        match event {
            DocEvent::Update {
                guid,
                update,
                origin,
            } => {
                // Echo suppression: only locally authored updates go out.
                if origin == Origin::Local {
                    self.send_doc_update(outgoing, guid, &update).await?;
                }
            }
            DocEvent::Subdocs { added, removed, .. } => {
                for doc in added {
                    registry.register(doc);
                }
                for guid in removed {
                    registry.unregister(guid);
                }
            }
            DocEvent::Destroyed { guid } => {
                registry.unregister(guid);
            }
        }
        Ok(())
    }

    async fn handle_awareness_event(
        &mut self,
        event: AwarenessEvent,
        outgoing: &mpsc::Sender<Frame>,
    ) -> Result<(), ProtocolError> {
        // Server-applied changes are not echoed back.
        if event.origin == Origin::Remote {
            return Ok(());
        }

        let changed = event.changes.changed_clients();
        if changed.is_empty() {
            return Ok(());
        }

        let (update, local_leaving) = {
            let awareness = self.awareness.read().await;
            (
                awareness.encode_update(&changed),
                event.changes.removed.contains(&awareness.client_id()),
            )
        };
        if local_leaving {
            // Gate socket teardown on the server acking this frame.
            self.leave_pending = true;
        }
        self.send_awareness_update(outgoing, update).await
    }

    async fn send_doc_update(
        &self,
        outgoing: &mpsc::Sender<Frame>,
        guid: Uuid,
        update: &[u8],
    ) -> Result<(), ProtocolError> {
        outgoing
            .send(Frame::ClientUpdate {
                workspace_id: self.workspace_id,
                guid,
                update: codec::encode_update(update),
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send_awareness_update(
        &self,
        outgoing: &mpsc::Sender<Frame>,
        update: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        outgoing
            .send(Frame::AwarenessUpdate {
                workspace_id: self.workspace_id,
                awareness_update: codec::encode_update(&update),
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// One-time handshake for the whole subdocument tree: push each
    /// subdocument's full state so the server learns about documents it
    /// has never seen.
    async fn subdoc_handshake(
        &self,
        outgoing: &mpsc::Sender<Frame>,
        doc: &Arc<dyn CrdtDoc>,
    ) -> Result<(), ProtocolError> {
        let mut stack = doc.subdocs();
        while let Some(subdoc) = stack.pop() {
            match subdoc.encode_state_as_update(None) {
                Ok(update) => {
                    self.send_doc_update(outgoing, subdoc.guid(), &update)
                        .await?
                }
                Err(e) => log::warn!(
                    "Skipping subdoc {} in handshake: {e}",
                    subdoc.guid()
                ),
            }
            stack.extend(subdoc.subdocs());
        }
        Ok(())
    }
}
