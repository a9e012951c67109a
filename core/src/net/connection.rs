// Connection manager — persistent peer connections with relayed fallback
//
// Every connection, dialed or accepted, gets one reader task feeding
// frames to the attached handler; requests and responses are correlated
// by message id, so either side of a connection can originate a request
// and a peer behind NAT stays reachable over the connection it opened.
// When a direct dial fails, a circuit through up to three relays is
// tried and the route is cached in place of the direct connection.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::dht::{KademliaNode, NodeId, RoutingTable};
use crate::wire::{read_frame, write_frame, CircuitId, KademliaMessage, MessageBody, WireError};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer not found in routing table")]
    UnknownNode,
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("request timed out")]
    RequestTimeout,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("no relay accepted a circuit to the target")]
    NoRelayPath,
    #[error("relay refused circuit: {0}")]
    CircuitRefused(String),
    #[error("peer sent an unexpected reply")]
    UnexpectedResponse,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live TCP connection to a peer. Writes are serialized; reads happen
/// in the reader task owned by the manager.
pub struct PeerConn {
    peer: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl PeerConn {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }
}

/// Receives every inbound frame from every connection. Returning false
/// closes the connection.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, conn: &Arc<PeerConn>, frame: Vec<u8>) -> bool;
}

/// Establishes a circuit through `relay` to `target`; implemented by the
/// RPC layer since it owns request correlation.
#[async_trait]
pub trait CircuitDialer: Send + Sync {
    async fn establish_circuit(
        &self,
        relay: &KademliaNode,
        target: NodeId,
    ) -> Result<CircuitId, NetError>;
}

#[derive(Clone)]
enum Route {
    Direct(Arc<PeerConn>),
    Relayed { relay: NodeId, circuit: CircuitId },
}

struct CachedRoute {
    route: Route,
    last_used: Instant,
}

/// Connection statistics for status reporting.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub cached: usize,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    local_id: NodeId,
    local_public_key: Vec<u8>,
    routing: Arc<RoutingTable>,
    cache: Mutex<HashMap<NodeId, CachedRoute>>,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    dialer: RwLock<Option<Arc<dyn CircuitDialer>>>,
    announce_frame: RwLock<Option<Arc<Vec<u8>>>>,
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        local_id: NodeId,
        local_public_key: Vec<u8>,
        routing: Arc<RoutingTable>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            local_id,
            local_public_key,
            routing,
            cache: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            dialer: RwLock::new(None),
            announce_frame: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Frame sent as the opener on every new connection, both dialed and
    /// accepted, announcing this node's listening endpoint.
    pub fn set_announce_frame(&self, frame: Vec<u8>) {
        *self.announce_frame.write() = Some(Arc::new(frame));
    }

    pub fn set_frame_handler(&self, handler: Arc<dyn FrameHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_circuit_dialer(&self, dialer: Arc<dyn CircuitDialer>) {
        *self.dialer.write() = Some(dialer);
    }

    /// Drop handler references and cached routes; breaks shutdown cycles.
    pub fn detach(&self) {
        *self.handler.write() = None;
        *self.dialer.write() = None;
        *self.announce_frame.write() = None;
        self.cache.lock().clear();
    }

    /// Take ownership of a connection and spawn its reader loop.
    /// `first_frame_timeout` bounds how long a fresh inbound connection may
    /// sit silent before it is dropped.
    pub fn adopt(
        &self,
        stream: TcpStream,
        first_frame_timeout: Option<Duration>,
    ) -> Arc<PeerConn> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(PeerConn {
            peer,
            writer: AsyncMutex::new(write_half),
            closed: AtomicBool::new(false),
        });

        if let Some(manager) = self.self_ref.upgrade() {
            let reader_conn = Arc::clone(&conn);
            tokio::spawn(async move {
                manager
                    .reader_loop(read_half, reader_conn, first_frame_timeout)
                    .await;
            });
        }

        if let Some(frame) = self.announce_frame.read().clone() {
            let announce_conn = Arc::clone(&conn);
            tokio::spawn(async move {
                if let Err(err) = announce_conn.send_frame(&frame).await {
                    debug!(peer = %announce_conn.peer(), %err, "announce failed");
                }
            });
        }
        conn
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        conn: Arc<PeerConn>,
        first_frame_timeout: Option<Duration>,
    ) {
        let mut first = first_frame_timeout;
        loop {
            let result = match first.take() {
                Some(limit) => match timeout(limit, read_frame(&mut read_half)).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(peer = %conn.peer(), "no frame before read timeout");
                        break;
                    }
                },
                None => read_frame(&mut read_half).await,
            };

            match result {
                Ok(frame) => {
                    let handler = self.handler.read().clone();
                    match handler {
                        Some(handler) => {
                            if !handler.handle_frame(&conn, frame).await {
                                break;
                            }
                        }
                        None => debug!(peer = %conn.peer(), "frame dropped, no handler attached"),
                    }
                }
                Err(WireError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => {
                    debug!(peer = %conn.peer(), %err, "closing connection on bad frame");
                    break;
                }
            }
        }
        conn.closed.store(true, Ordering::Relaxed);
        self.forget_conn(&conn);
    }

    fn forget_conn(&self, conn: &Arc<PeerConn>) {
        self.cache.lock().retain(|_, cached| match &cached.route {
            Route::Direct(existing) => !Arc::ptr_eq(existing, conn),
            Route::Relayed { .. } => true,
        });
    }

    /// Remember a connection as the direct route to a node. Called by the
    /// dispatcher once an inbound peer has identified itself.
    pub fn register_direct(&self, id: NodeId, conn: Arc<PeerConn>) {
        if id == self.local_id || conn.is_closed() {
            return;
        }
        self.cache.lock().insert(
            id,
            CachedRoute {
                route: Route::Direct(conn),
                last_used: Instant::now(),
            },
        );
    }

    pub async fn dial(
        &self,
        address: SocketAddr,
    ) -> Result<Arc<PeerConn>, NetError> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(NetError::Io(err)),
            Err(_) => return Err(NetError::ConnectTimeout(address)),
        };
        Ok(self.adopt(stream, None))
    }

    /// Send one frame, retrying once through a fresh route on failure.
    pub async fn send_to_node(
        &self,
        node: &KademliaNode,
        frame: &[u8],
    ) -> Result<(), NetError> {
        match self.try_send(node, frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(peer = %node.id, %err, "send failed, retrying on a fresh route");
                self.invalidate(&node.id);
                self.try_send(node, frame).await
            }
        }
    }

    /// Send over the cached direct connection or a fresh dial; never falls
    /// back to a relay circuit. For flows that have their own fallback,
    /// where a circuit's fire-and-forget success would mask a dead target.
    pub async fn send_direct(
        &self,
        node: &KademliaNode,
        frame: &[u8],
    ) -> Result<(), NetError> {
        let conn = match self.cached(&node.id) {
            Some(Route::Direct(conn)) => conn,
            _ => {
                let conn = self.dial(node.address).await?;
                self.register_direct(node.id, Arc::clone(&conn));
                conn
            }
        };
        conn.send_frame(frame).await
    }

    /// Send to a node known only by id: cached route, then routing table.
    pub async fn send_to_peer_id(
        &self,
        id: &NodeId,
        frame: &[u8],
    ) -> Result<(), NetError> {
        if let Some(route) = self.cached(id) {
            return self.send_via(route, frame).await;
        }
        let node = self.routing.get(id).ok_or(NetError::UnknownNode)?;
        self.send_to_node(&node, frame).await
    }

    async fn try_send(
        &self,
        node: &KademliaNode,
        frame: &[u8],
    ) -> Result<(), NetError> {
        let route = self.route_for(node).await?;
        self.send_via(route, frame).await
    }

    async fn send_via(&self, route: Route, frame: &[u8]) -> Result<(), NetError> {
        match route {
            Route::Direct(conn) => conn.send_frame(frame).await,
            Route::Relayed { relay, circuit } => {
                let wrapper = KademliaMessage::new(
                    self.local_id,
                    self.local_public_key.clone(),
                    MessageBody::RelayData {
                        circuit_id: circuit,
                        data: frame.to_vec(),
                    },
                );
                let bytes = wrapper.serialize()?;
                let relay_conn = self.direct_conn(&relay).await?;
                relay_conn.send_frame(&bytes).await
            }
        }
    }

    /// A direct connection to `id`: cached, or dialed via the routing table.
    async fn direct_conn(&self, id: &NodeId) -> Result<Arc<PeerConn>, NetError> {
        if let Some(Route::Direct(conn)) = self.cached(id) {
            return Ok(conn);
        }
        let node = self.routing.get(id).ok_or(NetError::UnknownNode)?;
        let conn = self.dial(node.address).await?;
        self.register_direct(*id, Arc::clone(&conn));
        Ok(conn)
    }

    async fn route_for(&self, node: &KademliaNode) -> Result<Route, NetError> {
        if let Some(route) = self.cached(&node.id) {
            return Ok(route);
        }

        match self.dial(node.address).await {
            Ok(conn) => {
                self.register_direct(node.id, Arc::clone(&conn));
                Ok(Route::Direct(conn))
            }
            Err(direct_err) => {
                debug!(peer = %node.id, %direct_err, "direct dial failed, trying relays");
                self.relayed_route(node).await
            }
        }
    }

    /// Sample relay candidates and take the first that accepts a circuit.
    async fn relayed_route(&self, target: &KademliaNode) -> Result<Route, NetError> {
        let dialer = self.dialer.read().clone().ok_or(NetError::NoRelayPath)?;

        let candidates: Vec<KademliaNode> = self
            .routing
            .get_random_nodes(self.config.relay_attempts + 1)
            .into_iter()
            .filter(|n| n.id != target.id && n.id != self.local_id)
            .take(self.config.relay_attempts)
            .collect();

        for relay in candidates {
            // Only directly reachable relays: keeps circuit establishment
            // from recursing into further relay fallback.
            if self.direct_conn(&relay.id).await.is_err() {
                debug!(relay = %relay.id, "relay not directly reachable");
                continue;
            }
            match dialer.establish_circuit(&relay, target.id).await {
                Ok(circuit) => {
                    let route = Route::Relayed {
                        relay: relay.id,
                        circuit,
                    };
                    self.cache.lock().insert(
                        target.id,
                        CachedRoute {
                            route: route.clone(),
                            last_used: Instant::now(),
                        },
                    );
                    debug!(target = %target.id, relay = %relay.id, "relayed route established");
                    return Ok(route);
                }
                Err(err) => debug!(relay = %relay.id, %err, "circuit attempt failed"),
            }
        }
        Err(NetError::NoRelayPath)
    }

    fn cached(&self, id: &NodeId) -> Option<Route> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(id)?;
        if let Route::Direct(conn) = &entry.route {
            if conn.is_closed() {
                cache.remove(id);
                return None;
            }
        }
        entry.last_used = Instant::now();
        Some(entry.route.clone())
    }

    pub fn invalidate(&self, id: &NodeId) {
        self.cache.lock().remove(id);
    }

    /// Drop cached routes past the idle timeout.
    pub fn evict_idle(&self) {
        let idle = self.config.idle_timeout;
        let now = Instant::now();
        self.cache
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_used) < idle);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            cached: self.cache.lock().len(),
        }
    }
}

/// One-shot frame push to a bare endpoint: connect, write, close. Used for
/// onion forwarding where no reply ever comes back on the same socket.
pub(crate) async fn push_frame(
    address: SocketAddr,
    frame: &[u8],
    connect_timeout: Duration,
) -> Result<(), NetError> {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(NetError::Io(err)),
        Err(_) => return Err(NetError::ConnectTimeout(address)),
    };
    write_frame(&mut stream, frame).await?;
    Ok(())
}

/// One-shot request/response on a dedicated socket. Used by the stateless
/// relay to pipe a foreign frame without touching its own correlation map.
pub(crate) async fn one_shot_request(
    address: SocketAddr,
    frame: &[u8],
    connect_timeout: Duration,
    reply_timeout: Duration,
) -> Result<Vec<u8>, NetError> {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(NetError::Io(err)),
        Err(_) => return Err(NetError::ConnectTimeout(address)),
    };
    write_frame(&mut stream, frame).await?;
    match timeout(reply_timeout, read_frame(&mut stream)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NetError::RequestTimeout),
    }
}
