//! Overlay node
//!
//! Owns the identity, the DHT node, the onion engine, the peer set, and
//! the mixer. The stream listener accepts newline-delimited JSON frames;
//! every inbound frame passes through the mixer before dispatch. Outbound
//! anonymous sends pick relay candidates from the routing table, wrap the
//! payload, and hand the envelope to the first hop over a one-shot
//! stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use async_trait::async_trait;
use rand::Rng;
use rand::RngCore;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use veilnet_core::{Frame, Hop, MeshRole, MeshType, NodeId, OnionLayer, OverlayConfig};
use veilnet_crypto::{peel, Identity, Peeled};
use veilnet_dht::DhtNode;

use crate::circuit::{relay_record_key, OnionEngine, RelayRecord, Resolver};
use crate::mixer::{MixedFrame, Mixer};
use crate::peers::PeerSet;
use crate::{OverlayError, Result};

/// Base interval of the cover-traffic task
const COVER_TRAFFIC_BASE: Duration = Duration::from_secs(5);

/// Random extra delay added to every cover-traffic interval
const COVER_TRAFFIC_JITTER_MS: u64 = 10_000;

/// Size of a cover payload before encoding
const COVER_PAYLOAD_LEN: usize = 64;

/// Events surfaced to the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A terminal onion layer or plain ANONYMOUS_MESSAGE frame arrived
    AnonymousMessage { payload: Value },
    /// A stream peer was accepted or dialed
    PeerConnected { peer_id: u64 },
}

struct OverlayInner {
    config: OverlayConfig,
    identity: Identity,
    dht: DhtNode,
    engine: OnionEngine,
    peers: PeerSet,
    mixer: Mixer,
    events: mpsc::UnboundedSender<NodeEvent>,
    tcp_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running overlay node; clones share one state
#[derive(Clone)]
pub struct OverlayNode {
    inner: Arc<OverlayInner>,
}

/// Resolves relay ids through the records relays publish into the DHT
struct DhtResolver {
    dht: DhtNode,
}

#[async_trait]
impl Resolver for DhtResolver {
    async fn resolve(&self, id: NodeId) -> Option<Hop> {
        let value = self.dht.get(&relay_record_key(&id)).await.ok()??;
        let record: RelayRecord = serde_json::from_value(value).ok()?;
        let public_key: [u8; 32] = hex::decode(&record.public_key).ok()?.try_into().ok()?;
        let addr = record.address.parse().ok()?;
        Some(Hop {
            id: record.node_id,
            public_key,
            addr,
        })
    }
}

impl OverlayNode {
    /// Bind both sockets and start every background task. Returns the
    /// node handle and the receiver its events are emitted on.
    pub async fn start(
        bind: IpAddr,
        config: OverlayConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        let identity = Identity::generate();
        let id = NodeId::random();

        let dht = DhtNode::bind(
            id,
            SocketAddr::new(bind, config.port),
            config.k,
            config.alpha,
        )
        .await?;
        let listener = TcpListener::bind(SocketAddr::new(bind, config.port)).await?;
        let tcp_addr = listener.local_addr()?;
        info!(%id, %tcp_addr, "overlay node listening");

        let (mixer, mixed_rx) = Mixer::new(Duration::from_millis(config.mixing_delay_max_ms));
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = OnionEngine::new(Arc::new(DhtResolver { dht: dht.clone() }));

        let node = Self {
            inner: Arc::new(OverlayInner {
                config,
                identity,
                dht: dht.clone(),
                engine,
                peers: PeerSet::new(),
                mixer,
                events,
                tcp_addr,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let mut tasks = vec![dht.spawn_recv_loop(), dht.spawn_sweep_task()];
        tasks.push(node.spawn_accept_loop(listener));
        tasks.push(node.spawn_dispatcher(mixed_rx));
        if node.inner.config.cover_traffic_enabled {
            tasks.push(node.spawn_cover_traffic());
        }
        *node.inner.tasks.lock().expect("task list lock poisoned") = tasks;

        node.dial_supernodes().await;

        Ok((node, events_rx))
    }

    /// A structured-mesh leaf dials every configured supernode at startup
    async fn dial_supernodes(&self) {
        let mesh = &self.inner.config.mesh;
        if mesh.mesh_type != MeshType::Structured || mesh.role != MeshRole::Leaf {
            return;
        }
        for endpoint in &mesh.supernode_list {
            match endpoint.parse::<SocketAddr>() {
                Ok(addr) => {
                    if let Err(e) = self.connect_peer(addr).await {
                        warn!(%addr, "supernode dial failed: {e}");
                    }
                }
                Err(_) => warn!(%endpoint, "ignoring unparseable supernode endpoint"),
            }
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.dht.id()
    }

    pub fn dht(&self) -> &DhtNode {
        &self.inner.dht
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Stream endpoint peers and relays reach this node on
    pub fn tcp_addr(&self) -> SocketAddr {
        self.inner.tcp_addr
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn live_circuits(&self) -> usize {
        self.inner.engine.live_circuits()
    }

    /// Publish this relay's contact record so circuit builders can
    /// resolve its id
    pub async fn announce(&self) -> Result<()> {
        let record = RelayRecord {
            node_id: self.id(),
            address: self.inner.tcp_addr.to_string(),
            public_key: hex::encode(self.inner.identity.encryption_public()),
        };
        let value = serde_json::to_value(record)
            .map_err(|e| veilnet_core::WireError::Malformed(e.to_string()))?;
        self.inner
            .dht
            .put(&relay_record_key(&self.id()), value)
            .await?;
        Ok(())
    }

    /// Dial a persistent stream peer
    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<u64> {
        let stream = TcpStream::connect(addr).await?;
        Ok(self.register_peer(stream))
    }

    /// Datagram handshake toward an endpoint behind a NAT
    pub async fn hole_punch(&self, addr: SocketAddr) -> Result<bool> {
        Ok(self.inner.dht.hole_punch(addr).await?)
    }

    /// Queue a frame for a connected stream peer. False once the peer is
    /// gone.
    pub fn send_to_peer(&self, peer_id: u64, frame: &Frame) -> bool {
        self.inner.peers.send_to(peer_id, frame)
    }

    /// Send a payload through a fresh circuit of randomly chosen relays.
    ///
    /// Draws `circuit_length` random 160-bit keys, takes the closest known
    /// contact to each (duplicates permitted), builds and wraps, then
    /// hands the envelope to the first hop over a one-shot stream.
    pub async fn send_anonymous(&self, payload: Value) -> Result<Uuid> {
        let mut ids = Vec::with_capacity(self.inner.config.circuit_length);
        for _ in 0..self.inner.config.circuit_length {
            let probe = NodeId::random();
            for contact in self.inner.dht.closest(&probe, 1) {
                ids.push(contact.id);
            }
        }

        let circuit = self
            .inner
            .engine
            .build_circuit(&ids)
            .await
            .ok_or(OverlayError::NoRelays)?;
        let (envelope, first) = self.inner.engine.wrap_for(circuit.id, &payload)?;

        self.send_oneshot(
            first.addr,
            &Frame::OnionPacket {
                packet: envelope,
                circuit_id: circuit.id,
            },
        )
        .await?;
        Ok(circuit.id)
    }

    /// Abort every background task
    pub fn shutdown(&self) {
        for task in self
            .inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("stream accept failed: {e}");
                        continue;
                    }
                };
                let mesh = &node.inner.config.mesh;
                if mesh.mesh_type == MeshType::Unstructured
                    && node.inner.peers.len() >= mesh.max_peer_connections
                {
                    debug!(%remote, "peer cap reached, refusing stream");
                    continue;
                }
                node.register_peer(stream);
            }
        })
    }

    /// Wire a connection into the peer set and start its reader task
    fn register_peer(&self, stream: TcpStream) -> u64 {
        let (read_half, write_half) = stream.into_split();
        let peer_id = self.inner.peers.insert(write_half);

        let node = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match Frame::decode(&line) {
                        Ok(Frame::Unknown) => debug!(peer_id, "dropping frame with unknown tag"),
                        Ok(frame) => node.inner.mixer.enqueue(peer_id, frame),
                        Err(e) => debug!(peer_id, "dropping malformed frame: {e}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(peer_id, "peer read failed: {e}");
                        break;
                    }
                }
            }
            node.inner.peers.remove(peer_id);
            debug!(peer_id, "peer closed");
        });

        let _ = self.inner.events.send(NodeEvent::PeerConnected { peer_id });
        peer_id
    }

    fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<MixedFrame>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(mixed) = rx.recv().await {
                // A failing handler never takes the node down
                if let Err(e) = node.dispatch(mixed.frame).await {
                    debug!(peer_id = mixed.peer_id, "dispatch failed: {e}");
                }
            }
        })
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::OnionPacket { packet, circuit_id } => {
                self.handle_onion(packet, circuit_id).await
            }
            Frame::DhtQuery { key, value } => {
                // Thin adapter over the store; a bare query carries
                // nothing to act on without a response path
                if let Some(value) = value {
                    self.inner.dht.store_local(key, value);
                }
                Ok(())
            }
            Frame::PeerDiscovery { contacts } => {
                for contact in contacts {
                    match contact.address.parse() {
                        Ok(addr) => self.inner.dht.observe(contact.node_id, addr),
                        Err(_) => debug!(address = %contact.address, "bad discovery endpoint"),
                    }
                }
                Ok(())
            }
            Frame::AnonymousMessage { payload } => {
                let _ = self
                    .inner
                    .events
                    .send(NodeEvent::AnonymousMessage { payload });
                Ok(())
            }
            // Cover traffic has no handler by design
            Frame::DummyTraffic { .. } => Ok(()),
            _ => {
                debug!("dropping datagram frame on stream transport");
                Ok(())
            }
        }
    }

    /// Peel one onion layer: forward interior layers over a fresh
    /// one-shot stream, surface terminal payloads, silently drop anything
    /// that fails to decrypt.
    async fn handle_onion(&self, packet: OnionLayer, circuit_id: Uuid) -> Result<()> {
        let secret = self.inner.identity.encryption_secret();
        match peel(&packet, &secret) {
            Ok(Peeled::Forward { next_hop, packet }) => {
                self.send_oneshot(
                    next_hop,
                    &Frame::OnionPacket {
                        packet,
                        circuit_id,
                    },
                )
                .await
            }
            Ok(Peeled::Deliver { payload, .. }) => {
                let _ = self
                    .inner
                    .events
                    .send(NodeEvent::AnonymousMessage { payload });
                Ok(())
            }
            Err(_) => {
                debug!("dropping unpeelable onion layer");
                Ok(())
            }
        }
    }

    /// Open a stream, write one frame, close
    async fn send_oneshot(&self, addr: SocketAddr, frame: &Frame) -> Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut line = frame.encode()?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    fn spawn_cover_traffic(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..COVER_TRAFFIC_JITTER_MS);
                tokio::time::sleep(COVER_TRAFFIC_BASE + Duration::from_millis(jitter)).await;
                node.send_cover_frame();
            }
        })
    }

    /// One dummy frame toward a uniformly random peer, if any exists
    fn send_cover_frame(&self) {
        let Some((peer_id, handle)) = self.inner.peers.random_peer() else {
            return;
        };
        let mut data = [0u8; COVER_PAYLOAD_LEN];
        rand::thread_rng().fill_bytes(&mut data);
        let frame = Frame::DummyTraffic {
            data: BASE64.encode(data),
            timestamp: now_ms(),
        };
        if !handle.send(&frame) {
            debug!(peer_id, "cover frame send failed");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
