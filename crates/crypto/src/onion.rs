//! Onion envelope construction and peeling
//!
//! Builds nested sealed boxes along a circuit of relay hops. Each relay
//! opens exactly one layer and learns only the previous endpoint, the next
//! endpoint, and its own ciphertext; the terminal layer carries the
//! payload. Layer tags are random at every depth, so the outermost tag is
//! indistinguishable from an interior one and no relay can tell its
//! position in the circuit.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use veilnet_core::{Hop, OnionLayer};

use crate::encrypt::{open, seal};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OnionError {
    #[error("circuit has no hops")]
    EmptyCircuit,

    #[error("layer encryption failed")]
    EncryptionFailed,

    #[error("layer could not be peeled")]
    PeelFailed,
}

/// Result of peeling one layer
#[derive(Debug, Clone, PartialEq)]
pub enum Peeled {
    /// Interior layer: pass the inner packet to the next relay
    Forward {
        next_hop: SocketAddr,
        packet: OnionLayer,
    },
    /// Terminal layer: surface the payload
    Deliver { payload: Value, timestamp: u64 },
}

fn random_tag() -> String {
    let mut tag = [0u8; 16];
    OsRng.fill_bytes(&mut tag);
    hex::encode(tag)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn seal_layer(hop: &Hop, plaintext: &Value) -> Result<OnionLayer, OnionError> {
    let sealed = seal(&hop.public_key, plaintext.to_string().as_bytes())
        .map_err(|_| OnionError::EncryptionFailed)?;
    Ok(OnionLayer {
        ciphertext: BASE64.encode(sealed),
        next_hop_tag: random_tag(),
    })
}

/// Wrap a payload into nested layers along `hops` (first relay outermost).
///
/// The innermost layer, readable only by the last hop, is the terminal
/// delivery record `{ payload, timestamp }`; every interior layer tells
/// its relay the endpoint of the next one.
pub fn wrap(payload: &Value, hops: &[Hop]) -> Result<OnionLayer, OnionError> {
    let last = hops.len().checked_sub(1).ok_or(OnionError::EmptyCircuit)?;

    let terminal = json!({ "payload": payload, "timestamp": now_ms() });
    let mut packet = seal_layer(&hops[last], &terminal)?;

    for i in (0..last).rev() {
        let forwarding = json!({
            "packet": packet,
            "next_hop": hops[i + 1].addr.to_string(),
        });
        packet = seal_layer(&hops[i], &forwarding)?;
    }

    Ok(packet)
}

#[derive(Deserialize)]
struct ForwardRecord {
    packet: OnionLayer,
    next_hop: String,
}

#[derive(Deserialize)]
struct DeliverRecord {
    payload: Value,
    timestamp: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LayerPlaintext {
    Forward(ForwardRecord),
    Deliver(DeliverRecord),
}

/// Peel one layer with the relay's encryption secret.
///
/// Every failure collapses to [`OnionError::PeelFailed`]; the caller drops
/// the packet without answering on the wire.
pub fn peel(layer: &OnionLayer, recipient_secret: &[u8; 32]) -> Result<Peeled, OnionError> {
    let sealed = BASE64
        .decode(&layer.ciphertext)
        .map_err(|_| OnionError::PeelFailed)?;
    let plaintext = open(recipient_secret, &sealed).map_err(|_| OnionError::PeelFailed)?;

    match serde_json::from_slice(&plaintext).map_err(|_| OnionError::PeelFailed)? {
        LayerPlaintext::Forward(record) => {
            let next_hop = record
                .next_hop
                .parse()
                .map_err(|_| OnionError::PeelFailed)?;
            Ok(Peeled::Forward {
                next_hop,
                packet: record.packet,
            })
        }
        LayerPlaintext::Deliver(record) => Ok(Peeled::Deliver {
            payload: record.payload,
            timestamp: record.timestamp,
        }),
    }
}
