//! Datagram protocol node
//!
//! Owns the UDP socket, the routing table, and the value store. A single
//! reader task decodes inbound frames, feeds every sender into the routing
//! table, routes FOUND/NODES responses to their waiting query and
//! NAT_PUNCH_ACK to its one-shot listener, then answers protocol requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::select_all;
use serde_json::Value;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use veilnet_core::{key_hash, Contact, Frame, NodeId, WireContact};

use crate::routing::RoutingTable;
use crate::storage::ValueStore;

/// How long an outbound FIND_VALUE may wait for a matching FOUND
pub const FIND_VALUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a NAT punch waits for its ACK
pub const NAT_PUNCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval of the expired-entry sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MAX_DATAGRAM: usize = 4096;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] veilnet_core::WireError),
}

pub type Result<T> = std::result::Result<T, DhtError>;

struct DhtInner {
    id: NodeId,
    k: usize,
    alpha: usize,
    socket: UdpSocket,
    table: Mutex<RoutingTable>,
    store: Mutex<ValueStore>,
    queries: Mutex<HashMap<Uuid, oneshot::Sender<Frame>>>,
    punches: Mutex<HashMap<SocketAddr, oneshot::Sender<()>>>,
}

/// Handle to a running DHT node; clones share one socket and one state
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<DhtInner>,
}

impl DhtNode {
    /// Bind the datagram socket. Call [`DhtNode::spawn_recv_loop`] to
    /// start serving the protocol.
    pub async fn bind(id: NodeId, addr: SocketAddr, k: usize, alpha: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(%id, addr = %socket.local_addr()?, "dht node bound");
        Ok(Self {
            inner: Arc::new(DhtInner {
                id,
                k,
                alpha,
                socket,
                table: Mutex::new(RoutingTable::new(id, k)),
                store: Mutex::new(ValueStore::new()),
                queries: Mutex::new(HashMap::new()),
                punches: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    fn table(&self) -> MutexGuard<'_, RoutingTable> {
        self.inner.table.lock().expect("routing table lock poisoned")
    }

    fn store(&self) -> MutexGuard<'_, ValueStore> {
        self.inner.store.lock().expect("value store lock poisoned")
    }

    fn queries(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Frame>>> {
        self.inner.queries.lock().expect("query map lock poisoned")
    }

    fn punches(&self) -> MutexGuard<'_, HashMap<SocketAddr, oneshot::Sender<()>>> {
        self.inner.punches.lock().expect("punch map lock poisoned")
    }

    /// Record a peer in the routing table
    pub fn observe(&self, id: NodeId, addr: SocketAddr) {
        self.table().observe(id, addr);
    }

    /// The `count` known contacts closest to `target`
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.table().closest(target, count)
    }

    pub fn contact_count(&self) -> usize {
        self.table().contact_count()
    }

    /// Insert into the local store without hashing (used by the stream
    /// adapter, which already carries a 160-bit key)
    pub fn store_local(&self, key: NodeId, value: Value) {
        self.store().insert(key, value);
    }

    /// Read the local store without hashing or network traffic
    pub fn local_value(&self, key: &NodeId) -> Option<Value> {
        self.store().get(key)
    }

    /// Start the datagram reader task
    pub fn spawn_recv_loop(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, src) = match node.inner.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("datagram read failed: {e}");
                        continue;
                    }
                };
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    debug!(%src, "dropping non-utf8 datagram");
                    continue;
                };
                node.handle_datagram(text, src).await;
            }
        })
    }

    /// Start the periodic expired-entry sweep
    pub fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                node.store().evict_expired();
            }
        })
    }

    async fn handle_datagram(&self, text: &str, src: SocketAddr) {
        let frame = match Frame::decode(text) {
            Ok(Frame::Unknown) => {
                debug!(%src, "dropping frame with unknown tag");
                return;
            }
            Ok(frame) => frame,
            Err(e) => {
                debug!(%src, "dropping malformed frame: {e}");
                return;
            }
        };

        if let Some(sender) = frame.sender() {
            self.observe(sender, src);
        }

        // Lookup responses resolve their waiter; an expired query id means
        // the waiter timed out and the frame is dropped.
        if let Frame::Found { query_id, .. } | Frame::Nodes { query_id, .. } = &frame {
            let waiter = self.queries().remove(query_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => debug!(%src, "response for expired query"),
            }
            return;
        }

        match frame {
            Frame::Ping { .. } => {
                self.send_logged(&Frame::Pong { node_id: self.inner.id }, src)
                    .await;
            }
            Frame::Pong { .. } => {}
            Frame::Store { key, value, .. } => {
                self.store().insert(key, value);
            }
            Frame::FindValue { key, query_id, .. } => {
                let reply = match self.store().get(&key) {
                    Some(value) => Frame::Found {
                        node_id: self.inner.id,
                        key,
                        value,
                        query_id,
                    },
                    None => Frame::Nodes {
                        node_id: self.inner.id,
                        key,
                        nodes: self
                            .closest(&key, self.inner.k)
                            .into_iter()
                            .map(|c| WireContact {
                                node_id: c.id,
                                address: c.addr.to_string(),
                            })
                            .collect(),
                        query_id,
                    },
                };
                self.send_logged(&reply, src).await;
            }
            Frame::NatPunch { .. } => {
                self.send_logged(&Frame::NatPunchAck { node_id: self.inner.id }, src)
                    .await;
            }
            Frame::NatPunchAck { .. } => {
                // One-shot listeners match on the exact source endpoint
                if let Some(tx) = self.punches().remove(&src) {
                    let _ = tx.send(());
                }
            }
            _ => debug!(%src, "dropping stream frame on datagram socket"),
        }
    }

    async fn send(&self, frame: &Frame, addr: SocketAddr) -> Result<()> {
        let text = frame.encode()?;
        self.inner.socket.send_to(text.as_bytes(), addr).await?;
        Ok(())
    }

    async fn send_logged(&self, frame: &Frame, addr: SocketAddr) {
        if let Err(e) = self.send(frame, addr).await {
            warn!(%addr, "datagram send failed: {e}");
        }
    }

    /// Store locally, then replicate STORE to the k closest contacts.
    /// Returns the number of peers the value was sent to.
    pub async fn put(&self, key: &str, value: Value) -> Result<usize> {
        self.put_with_ttl(key, value, None).await
    }

    /// Like [`DhtNode::put`] with an explicit TTL for the local entry.
    /// Replicas always use the receiver's default TTL; the wire format
    /// carries no lifetime.
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let hash = key_hash(key);
        match ttl {
            Some(ttl) => self.store().insert_with_ttl(hash, value.clone(), ttl),
            None => self.store().insert(hash, value.clone()),
        }

        let targets = self.closest(&hash, self.inner.k);
        let frame = Frame::Store {
            node_id: self.inner.id,
            key: hash,
            value,
        };
        let sends = targets.iter().map(|c| self.send(&frame, c.addr));
        let results = futures::future::join_all(sends).await;

        let mut replicated = 0;
        for (contact, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => replicated += 1,
                Err(e) => warn!(peer = %contact.id, "store replication failed: {e}"),
            }
        }
        Ok(replicated)
    }

    /// A fresh local entry wins without any network traffic; otherwise fan
    /// out FIND_VALUE to the alpha closest contacts and take the first
    /// matching FOUND. NODES responses and timeouts count as misses.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let hash = key_hash(key);
        if let Some(value) = self.store().get(&hash) {
            return Ok(Some(value));
        }

        let targets = self.closest(&hash, self.inner.alpha);
        if targets.is_empty() {
            return Ok(None);
        }

        let mut query_ids = Vec::with_capacity(targets.len());
        let mut waiters = Vec::with_capacity(targets.len());
        for contact in &targets {
            let query_id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            self.queries().insert(query_id, tx);
            query_ids.push(query_id);
            waiters.push(rx);

            let frame = Frame::FindValue {
                node_id: self.inner.id,
                key: hash,
                query_id,
            };
            if let Err(e) = self.send(&frame, contact.addr).await {
                warn!(peer = %contact.id, "find_value send failed: {e}");
            }
        }

        let found = tokio::time::timeout(FIND_VALUE_TIMEOUT, first_found(waiters))
            .await
            .unwrap_or(None);

        // Deallocate every waiter that did not resolve
        let mut queries = self.queries();
        for query_id in query_ids {
            queries.remove(&query_id);
        }
        Ok(found)
    }

    /// Fire a PING; the peer lands in the routing table when its PONG
    /// arrives, and this node lands in the peer's on receipt.
    pub async fn ping(&self, addr: SocketAddr) -> Result<()> {
        self.send(&Frame::Ping { node_id: self.inner.id }, addr).await
    }

    /// Introduce this node to a seed peer
    pub async fn bootstrap(&self, addr: SocketAddr) -> Result<()> {
        self.ping(addr).await
    }

    /// Datagram handshake across a NAT. True iff the ACK arrives from
    /// exactly the probed endpoint within the timeout.
    pub async fn hole_punch(&self, addr: SocketAddr) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.punches().insert(addr, tx);

        let frame = Frame::NatPunch {
            node_id: self.inner.id,
            timestamp: now_ms(),
        };
        if let Err(e) = self.send(&frame, addr).await {
            self.punches().remove(&addr);
            return Err(e);
        }

        match tokio::time::timeout(NAT_PUNCH_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(true),
            _ => {
                self.punches().remove(&addr);
                Ok(false)
            }
        }
    }
}

/// Race lookup responses; the first FOUND wins, NODES-only rounds miss
async fn first_found(waiters: Vec<oneshot::Receiver<Frame>>) -> Option<Value> {
    let mut remaining = waiters;
    while !remaining.is_empty() {
        let (result, _, rest) = select_all(remaining).await;
        if let Ok(Frame::Found { value, .. }) = result {
            return Some(value);
        }
        remaining = rest;
    }
    None
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
