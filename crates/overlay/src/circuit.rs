//! Circuit assembly and the onion engine
//!
//! Resolves relay ids to hops through a resolver capability supplied by
//! the owning node, remembers circuits under fresh 128-bit ids, and wraps
//! payloads for the first hop. Live circuits are capped; building past
//! the cap evicts the least recently used.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use veilnet_core::{Hop, NodeId, OnionLayer};
use veilnet_crypto::wrap;

use crate::{OverlayError, Result};

/// Default cap on remembered circuits
const MAX_LIVE_CIRCUITS: usize = 64;

/// Key under which a relay publishes its contact record
pub fn relay_record_key(id: &NodeId) -> String {
    format!("relay:{id}")
}

/// Contact record a relay publishes into the DHT so circuit builders can
/// resolve its id to a public key and stream endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    /// Stream endpoint, "host:port"
    pub address: String,
    /// X25519 encryption key, hex
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Capability to resolve a relay id to a usable hop
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, id: NodeId) -> Option<Hop>;
}

/// An assembled relay path
#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: Uuid,
    pub hops: Vec<Hop>,
}

struct CircuitEntry {
    circuit: Circuit,
    last_used: Instant,
}

pub struct OnionEngine {
    resolver: Arc<dyn Resolver>,
    circuits: Mutex<HashMap<Uuid, CircuitEntry>>,
    max_live: usize,
}

impl OnionEngine {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self::with_capacity(resolver, MAX_LIVE_CIRCUITS)
    }

    pub fn with_capacity(resolver: Arc<dyn Resolver>, max_live: usize) -> Self {
        Self {
            resolver,
            circuits: Mutex::new(HashMap::new()),
            max_live,
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<Uuid, CircuitEntry>> {
        self.circuits.lock().expect("circuit registry lock poisoned")
    }

    /// Assemble a circuit from candidate relay ids.
    ///
    /// Ids that do not resolve are skipped, so the circuit may come out
    /// shorter than requested. A circuit with no hops at all is not
    /// retained and yields `None`.
    pub async fn build_circuit(&self, ids: &[NodeId]) -> Option<Circuit> {
        let mut hops = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resolver.resolve(*id).await {
                Some(hop) => hops.push(hop),
                None => debug!(%id, "skipping unresolvable relay"),
            }
        }
        if hops.is_empty() {
            return None;
        }

        let circuit = Circuit {
            id: Uuid::new_v4(),
            hops,
        };
        let mut circuits = self.circuits();
        circuits.insert(
            circuit.id,
            CircuitEntry {
                circuit: circuit.clone(),
                last_used: Instant::now(),
            },
        );
        while circuits.len() > self.max_live {
            if let Some(oldest) = circuits
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id)
            {
                circuits.remove(&oldest);
            }
        }
        Some(circuit)
    }

    /// Wrap a payload for a live circuit, refreshing its slot in the
    /// registry. Returns the outermost envelope and the first hop.
    pub fn wrap_for(&self, circuit_id: Uuid, payload: &Value) -> Result<(OnionLayer, Hop)> {
        let mut circuits = self.circuits();
        let entry = circuits
            .get_mut(&circuit_id)
            .ok_or(OverlayError::UnknownCircuit)?;
        entry.last_used = Instant::now();

        let envelope = wrap(payload, &entry.circuit.hops)?;
        let first = entry.circuit.hops[0].clone();
        Ok((envelope, first))
    }

    pub fn circuit(&self, id: &Uuid) -> Option<Circuit> {
        self.circuits().get(id).map(|entry| entry.circuit.clone())
    }

    pub fn live_circuits(&self) -> usize {
        self.circuits().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use veilnet_crypto::{peel, EncryptionKeypair, Peeled};

    struct MapResolver {
        hops: StdHashMap<NodeId, Hop>,
    }

    #[async_trait]
    impl Resolver for MapResolver {
        async fn resolve(&self, id: NodeId) -> Option<Hop> {
            self.hops.get(&id).cloned()
        }
    }

    fn make_resolver(count: usize) -> (Arc<MapResolver>, Vec<NodeId>, Vec<EncryptionKeypair>) {
        let mut hops = StdHashMap::new();
        let mut ids = Vec::new();
        let mut keypairs = Vec::new();
        for i in 0..count {
            let id = NodeId::random();
            let keypair = EncryptionKeypair::generate();
            hops.insert(
                id,
                Hop {
                    id,
                    public_key: keypair.public_key_bytes(),
                    addr: format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
                },
            );
            ids.push(id);
            keypairs.push(keypair);
        }
        (Arc::new(MapResolver { hops }), ids, keypairs)
    }

    #[tokio::test]
    async fn test_build_circuit_resolves_all_hops() {
        let (resolver, ids, _) = make_resolver(3);
        let engine = OnionEngine::new(resolver);

        let circuit = engine.build_circuit(&ids).await.unwrap();
        assert_eq!(circuit.hops.len(), 3);
        assert_eq!(engine.live_circuits(), 1);
        assert_eq!(engine.circuit(&circuit.id).unwrap().hops.len(), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_ids_are_skipped() {
        let (resolver, mut ids, _) = make_resolver(2);
        ids.insert(1, NodeId::random());
        let engine = OnionEngine::new(resolver);

        let circuit = engine.build_circuit(&ids).await.unwrap();
        assert_eq!(circuit.hops.len(), 2);
    }

    #[tokio::test]
    async fn test_no_resolvable_ids_yields_none() {
        let (resolver, _, _) = make_resolver(0);
        let engine = OnionEngine::new(resolver);

        assert!(engine
            .build_circuit(&[NodeId::random(), NodeId::random()])
            .await
            .is_none());
        assert_eq!(engine.live_circuits(), 0);
    }

    #[tokio::test]
    async fn test_registry_caps_live_circuits() {
        let (resolver, ids, _) = make_resolver(1);
        let engine = OnionEngine::with_capacity(resolver, 3);

        let first = engine.build_circuit(&ids).await.unwrap();
        for _ in 0..3 {
            engine.build_circuit(&ids).await.unwrap();
        }

        assert_eq!(engine.live_circuits(), 3);
        // Oldest unused circuit was evicted
        assert!(engine.circuit(&first.id).is_none());
        assert!(engine.wrap_for(first.id, &json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_wrap_for_produces_peelable_envelope() {
        let (resolver, ids, keypairs) = make_resolver(2);
        let engine = OnionEngine::new(resolver);

        let circuit = engine.build_circuit(&ids).await.unwrap();
        let (envelope, first) = engine.wrap_for(circuit.id, &json!("msg")).unwrap();
        assert_eq!(first.id, ids[0]);

        let peeled = peel(&envelope, &keypairs[0].secret_key_bytes()).unwrap();
        assert!(matches!(peeled, Peeled::Forward { .. }));
    }

    #[tokio::test]
    async fn test_wrap_for_unknown_circuit() {
        let (resolver, _, _) = make_resolver(0);
        let engine = OnionEngine::new(resolver);

        assert!(matches!(
            engine.wrap_for(Uuid::new_v4(), &json!(1)),
            Err(OverlayError::UnknownCircuit)
        ));
    }
}
