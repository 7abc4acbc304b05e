//! Stream peer set
//!
//! Maps freshly assigned 64-bit peer ids to write handles, at most one
//! live connection per id. Writers run behind an unbounded channel so
//! dispatch never blocks on a slow peer; a closed connection removes its
//! entry exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;

use veilnet_core::Frame;

/// Write handle to one peer stream
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    /// Queue a frame as one newline-delimited line. False once the
    /// connection is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(line) => self.tx.send(line).is_ok(),
            Err(e) => {
                debug!("frame encoding failed: {e}");
                false
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct PeerSet {
    peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<u64, PeerHandle>> {
        self.peers.lock().expect("peer set lock poisoned")
    }

    /// Register a connection's write half under a fresh peer id and start
    /// its writer task
    pub fn insert(&self, mut writer: OwnedWriteHalf) -> u64 {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let peer_id = {
            let mut peers = self.peers();
            let mut id: u64 = rand::thread_rng().gen();
            while peers.contains_key(&id) {
                id = rand::thread_rng().gen();
            }
            peers.insert(id, PeerHandle { tx });
            id
        };

        tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!(peer_id, "peer write failed: {e}");
                    break;
                }
            }
        });

        peer_id
    }

    /// Drop a peer. True if it was present; the writer task ends once its
    /// channel closes.
    pub fn remove(&self, peer_id: u64) -> bool {
        self.peers().remove(&peer_id).is_some()
    }

    pub fn send_to(&self, peer_id: u64, frame: &Frame) -> bool {
        let handle = self.peers().get(&peer_id).cloned();
        match handle {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    /// A uniformly random live peer, if any
    pub fn random_peer(&self) -> Option<(u64, PeerHandle)> {
        let peers = self.peers();
        if peers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..peers.len());
        peers
            .iter()
            .nth(index)
            .map(|(id, handle)| (*id, handle.clone()))
    }

    pub fn contains(&self, peer_id: u64) -> bool {
        self.peers().contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }
}
