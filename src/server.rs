//! Reference sync server.
//!
//! ```text
//!             ┌──────────────────────────────┐
//! client A ──►│ room (workspace)             │──► client B
//!             │  docs: guid → CrdtDoc        │
//!             │  clients: id → outgoing tx   │
//!             └──────────────────────────────┘
//! ```
//!
//! One room per workspace, one handler task per client connection. The
//! room holds the authoritative document tree (created on demand by a
//! doc factory) and relays updates: apply to the server copy with
//! `Origin::Remote`, fan out to every other client in the room. Awareness
//! frames are relayed without interpretation, except that every
//! `AwarenessUpdate` is acked back to its sender.
//!
//! The server core speaks [`FrameSocket`], so tests drive it in-process
//! through [`SyncServer::open_channel`]; [`SyncServer::run_ws`] bolts the
//! websocket front end on top.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::codec;
use crate::doc::{CrdtDoc, MemoryDoc, Origin};
use crate::protocol::Frame;
use crate::transport::{ws_frame_socket, FrameSocket};

/// Creates the server-side document for a guid the server has not seen.
pub type DocFactory = Box<dyn Fn(Uuid) -> Arc<dyn CrdtDoc> + Send + Sync>;

struct Room {
    /// Authoritative copies, root and subdocuments alike.
    docs: HashMap<Uuid, Arc<dyn CrdtDoc>>,
    clients: HashMap<u64, mpsc::Sender<Frame>>,
}

impl Room {
    fn new() -> Self {
        Self {
            docs: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Senders for every client except `sender`, cloned so the caller can
    /// deliver after releasing the room lock.
    fn recipients(&self, sender: u64) -> Vec<mpsc::Sender<Frame>> {
        self.clients
            .iter()
            .filter(|(id, _)| **id != sender)
            .map(|(_, tx)| tx.clone())
            .collect()
    }
}

/// Fan a frame out without blocking. A client that stops draining its
/// socket gets frames dropped instead of wedging the sender's handler;
/// it resynchronizes through its next handshake.
fn broadcast(recipients: &[mpsc::Sender<Frame>], frame: &Frame) {
    for tx in recipients {
        if tx.try_send(frame.clone()).is_err() {
            log::warn!("Dropping frame for a slow or disconnected client");
        }
    }
}

struct ServerInner {
    rooms: Mutex<HashMap<Uuid, Room>>,
    doc_factory: DocFactory,
    next_client: std::sync::atomic::AtomicU64,
}

/// In-memory relay server for workspace synchronization.
pub struct SyncServer {
    inner: Arc<ServerInner>,
}

impl SyncServer {
    /// Server whose documents are [`MemoryDoc`]s.
    pub fn new() -> Self {
        Self::with_doc_factory(Box::new(|guid| -> Arc<dyn CrdtDoc> {
            MemoryDoc::with_guid(guid)
        }))
    }

    /// Server with caller-provided document construction (e.g. documents
    /// preloaded from storage).
    pub fn with_doc_factory(doc_factory: DocFactory) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                rooms: Mutex::new(HashMap::new()),
                doc_factory,
                next_client: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// The server's copy of a document, if it has one.
    pub async fn doc(&self, workspace_id: Uuid, guid: Uuid) -> Option<Arc<dyn CrdtDoc>> {
        let rooms = self.inner.rooms.lock().await;
        rooms.get(&workspace_id).and_then(|r| r.docs.get(&guid)).cloned()
    }

    /// Number of clients currently attached to a workspace room.
    pub async fn client_count(&self, workspace_id: Uuid) -> usize {
        let rooms = self.inner.rooms.lock().await;
        rooms.get(&workspace_id).map_or(0, |r| r.clients.len())
    }

    /// Attach an in-process client and return its socket. A handler task
    /// runs until the returned socket is dropped.
    pub fn open_channel(&self) -> FrameSocket {
        let (client_side, server_side) = FrameSocket::pair();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            handle_client(inner, server_side).await;
        });
        client_side
    }

    /// Serve websocket clients on `listener` until the task is aborted.
    pub async fn run_ws(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::info!("Client connected from {addr}");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => handle_client(inner, ws_frame_socket(ws)).await,
                    Err(e) => log::warn!("Websocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_client(inner: Arc<ServerInner>, socket: FrameSocket) {
    let FrameSocket {
        outgoing,
        mut incoming,
    } = socket;
    let client_id = inner
        .next_client
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    // Rooms this client has joined, for teardown.
    let mut joined: Vec<Uuid> = Vec::new();

    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::ClientHandshake { workspace_id } => {
                let mut rooms = inner.rooms.lock().await;
                let room = rooms.entry(workspace_id).or_insert_with(Room::new);
                room.clients.insert(client_id, outgoing.clone());
                if !joined.contains(&workspace_id) {
                    joined.push(workspace_id);
                }
                // Root doc exists from the first join onward.
                room.docs
                    .entry(workspace_id)
                    .or_insert_with(|| (inner.doc_factory)(workspace_id));

                // Answer with the server state of every known doc so the
                // client can diff against it.
                let handshakes: Vec<Frame> = room
                    .docs
                    .iter()
                    .filter_map(|(guid, doc)| match doc.encode_state_as_update(None) {
                        Ok(update) => Some(Frame::ServerHandshake {
                            guid: *guid,
                            update: codec::encode_update(&update),
                        }),
                        Err(e) => {
                            log::warn!("Cannot encode doc {guid} for handshake: {e}");
                            None
                        }
                    })
                    .collect();
                drop(rooms);
                for frame in handshakes {
                    if outgoing.send(frame).await.is_err() {
                        break;
                    }
                }
                log::info!("Client {client_id} joined workspace {workspace_id}");
            }

            Frame::ClientUpdate {
                workspace_id,
                guid,
                update,
            } => {
                let bytes = match codec::decode_update(&update) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Client {client_id}: malformed update for doc {guid}: {e}");
                        continue;
                    }
                };
                // Apply under the lock, deliver after dropping it.
                let recipients = {
                    let mut rooms = inner.rooms.lock().await;
                    let room = match rooms.get_mut(&workspace_id) {
                        Some(room) => room,
                        None => continue,
                    };
                    let doc = room
                        .docs
                        .entry(guid)
                        .or_insert_with(|| (inner.doc_factory)(guid))
                        .clone();
                    if let Err(e) = doc.apply_update(&bytes, Origin::Remote) {
                        log::warn!(
                            "Client {client_id}: undecodable update for doc {guid}: {e}"
                        );
                        continue;
                    }
                    room.recipients(client_id)
                };
                broadcast(&recipients, &Frame::ServerUpdate { guid, update });
            }

            Frame::AwarenessUpdate {
                workspace_id,
                awareness_update,
            } => {
                let recipients = {
                    let rooms = inner.rooms.lock().await;
                    match rooms.get(&workspace_id) {
                        Some(room) => room.recipients(client_id),
                        None => continue,
                    }
                };
                // Ack first: the sender may be gating its disconnect on it.
                let _ = outgoing.send(Frame::AwarenessAck { workspace_id }).await;
                broadcast(
                    &recipients,
                    &Frame::ServerAwarenessBroadcast {
                        workspace_id,
                        awareness_update,
                    },
                );
            }

            Frame::InitAwareness { workspace_id } => {
                let recipients = {
                    let rooms = inner.rooms.lock().await;
                    match rooms.get(&workspace_id) {
                        Some(room) => room.recipients(client_id),
                        None => continue,
                    }
                };
                broadcast(&recipients, &Frame::NewClientAwarenessInit);
            }

            other => {
                log::debug!("Client {client_id}: ignoring unexpected frame: {other:?}");
            }
        }
    }

    // Socket gone; leave every room.
    let mut rooms = inner.rooms.lock().await;
    for workspace_id in joined {
        if let Some(room) = rooms.get_mut(&workspace_id) {
            room.clients.remove(&client_id);
        }
    }
    log::info!("Client {client_id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(200);

    async fn recv_frame(socket: &mut FrameSocket) -> Frame {
        timeout(TICK, socket.incoming.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
    }

    async fn join(server: &SyncServer, workspace_id: Uuid) -> FrameSocket {
        let mut socket = server.open_channel();
        socket
            .outgoing
            .send(Frame::ClientHandshake { workspace_id })
            .await
            .unwrap();
        // Root doc handshake reply.
        assert!(matches!(
            recv_frame(&mut socket).await,
            Frame::ServerHandshake { .. }
        ));
        socket
    }

    #[tokio::test]
    async fn test_handshake_creates_room_and_replies_with_state() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();

        let mut socket = server.open_channel();
        socket
            .outgoing
            .send(Frame::ClientHandshake { workspace_id })
            .await
            .unwrap();

        match recv_frame(&mut socket).await {
            Frame::ServerHandshake { guid, update } => {
                assert_eq!(guid, workspace_id);
                // Fresh doc, empty update.
                assert!(codec::decode_update(&update).unwrap().is_empty());
            }
            other => panic!("Expected ServerHandshake, got {other:?}"),
        }
        assert_eq!(server.client_count(workspace_id).await, 1);
        assert!(server.doc(workspace_id, workspace_id).await.is_some());
    }

    #[tokio::test]
    async fn test_client_update_applied_and_relayed_to_others_only() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let mut alice = join(&server, workspace_id).await;
        let mut bob = join(&server, workspace_id).await;

        let source = MemoryDoc::new();
        let op = source.insert(vec![1]);
        let update = codec::encode_update(&source.encode_state_as_update(None).unwrap());
        alice
            .outgoing
            .send(Frame::ClientUpdate {
                workspace_id,
                guid: workspace_id,
                update: update.clone(),
            })
            .await
            .unwrap();

        // Bob sees the relay, Alice does not.
        match recv_frame(&mut bob).await {
            Frame::ServerUpdate { guid, update: relayed } => {
                assert_eq!(guid, workspace_id);
                assert_eq!(relayed, update);
            }
            other => panic!("Expected ServerUpdate, got {other:?}"),
        }
        assert!(timeout(TICK, alice.incoming.recv()).await.is_err());

        // The server copy converged too.
        let doc = server.doc(workspace_id, workspace_id).await.unwrap();
        let state = doc.encode_state_as_update(None).unwrap();
        let replica = MemoryDoc::new();
        replica.apply_update(&state, Origin::Remote).unwrap();
        assert!(replica.contains_op(op));
    }

    #[tokio::test]
    async fn test_update_for_new_guid_creates_server_doc() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let mut alice = join(&server, workspace_id).await;

        let subdoc_guid = Uuid::new_v4();
        let source = MemoryDoc::new();
        source.insert(vec![5]);
        alice
            .outgoing
            .send(Frame::ClientUpdate {
                workspace_id,
                guid: subdoc_guid,
                update: codec::encode_update(&source.encode_state_as_update(None).unwrap()),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.doc(workspace_id, subdoc_guid).await.is_some());

        // A later joiner receives handshakes for both docs.
        let mut carol = server.open_channel();
        carol
            .outgoing
            .send(Frame::ClientHandshake { workspace_id })
            .await
            .unwrap();
        let mut guids = Vec::new();
        for _ in 0..2 {
            match recv_frame(&mut carol).await {
                Frame::ServerHandshake { guid, .. } => guids.push(guid),
                other => panic!("Expected ServerHandshake, got {other:?}"),
            }
        }
        guids.sort();
        let mut expected = vec![workspace_id, subdoc_guid];
        expected.sort();
        assert_eq!(guids, expected);
    }

    #[tokio::test]
    async fn test_awareness_update_acked_and_broadcast() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let mut alice = join(&server, workspace_id).await;
        let mut bob = join(&server, workspace_id).await;

        let payload = codec::encode_update(&[1, 2, 3]);
        alice
            .outgoing
            .send(Frame::AwarenessUpdate {
                workspace_id,
                awareness_update: payload.clone(),
            })
            .await
            .unwrap();

        assert_eq!(
            recv_frame(&mut alice).await,
            Frame::AwarenessAck { workspace_id }
        );
        assert_eq!(
            recv_frame(&mut bob).await,
            Frame::ServerAwarenessBroadcast {
                workspace_id,
                awareness_update: payload,
            }
        );
    }

    #[tokio::test]
    async fn test_init_awareness_pokes_other_clients() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let mut alice = join(&server, workspace_id).await;
        let mut bob = join(&server, workspace_id).await;

        bob.outgoing
            .send(Frame::InitAwareness { workspace_id })
            .await
            .unwrap();

        assert_eq!(
            recv_frame(&mut alice).await,
            Frame::NewClientAwarenessInit
        );
        assert!(timeout(TICK, bob.incoming.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_client_does_not_stall_other_rooms() {
        let server = SyncServer::new();
        let busy_workspace = Uuid::new_v4();
        let mut alice = join(&server, busy_workspace).await;
        // Bob joins and then never drains his socket; his channel fills.
        let _bob = join(&server, busy_workspace).await;

        let update = codec::encode_update(&[]);
        for _ in 0..300 {
            alice
                .outgoing
                .send(Frame::ClientUpdate {
                    workspace_id: busy_workspace,
                    guid: busy_workspace,
                    update: update.clone(),
                })
                .await
                .unwrap();
        }

        // Bob's backlog must not wedge the server: a client of a
        // different workspace still gets its handshake answered.
        let other_workspace = Uuid::new_v4();
        let mut carol = server.open_channel();
        carol
            .outgoing
            .send(Frame::ClientHandshake {
                workspace_id: other_workspace,
            })
            .await
            .unwrap();
        assert!(matches!(
            recv_frame(&mut carol).await,
            Frame::ServerHandshake { .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_socket_leaves_room() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let alice = join(&server, workspace_id).await;
        let _bob = join(&server, workspace_id).await;
        assert_eq!(server.client_count(workspace_id).await, 2);

        drop(alice);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.client_count(workspace_id).await, 1);
    }

    #[tokio::test]
    async fn test_malformed_update_ignored() {
        let server = SyncServer::new();
        let workspace_id = Uuid::new_v4();
        let mut alice = join(&server, workspace_id).await;
        let mut bob = join(&server, workspace_id).await;

        alice
            .outgoing
            .send(Frame::ClientUpdate {
                workspace_id,
                guid: workspace_id,
                update: "not base64".to_string(),
            })
            .await
            .unwrap();

        assert!(timeout(TICK, bob.incoming.recv()).await.is_err());
    }
}
