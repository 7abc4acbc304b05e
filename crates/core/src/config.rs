//! Configuration types

use serde::{Deserialize, Serialize};

/// Overlay node settings.
///
/// All state derived from these values is process-local and volatile;
/// nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Bind port for both the datagram and the stream socket
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bucket size (Kademlia k)
    #[serde(default = "default_k")]
    pub k: usize,

    /// Lookup parallelism (Kademlia alpha)
    #[serde(default = "default_alpha")]
    pub alpha: usize,

    /// Relay hops per circuit
    #[serde(default = "default_circuit_length")]
    pub circuit_length: usize,

    /// Upper bound of the random inbound mixing delay
    #[serde(default = "default_mixing_delay_max_ms")]
    pub mixing_delay_max_ms: u64,

    /// Emit periodic dummy traffic toward a random peer
    #[serde(default = "default_true")]
    pub cover_traffic_enabled: bool,

    /// Mesh topology settings
    #[serde(default)]
    pub mesh: MeshSettings,
}

fn default_port() -> u16 {
    3000
}

fn default_k() -> usize {
    20
}

fn default_alpha() -> usize {
    3
}

fn default_circuit_length() -> usize {
    3
}

fn default_mixing_delay_max_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            k: default_k(),
            alpha: default_alpha(),
            circuit_length: default_circuit_length(),
            mixing_delay_max_ms: default_mixing_delay_max_ms(),
            cover_traffic_enabled: true,
            mesh: MeshSettings::default(),
        }
    }
}

/// Mesh topology settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    #[serde(default)]
    pub mesh_type: MeshType,

    /// Only meaningful under the structured mesh
    #[serde(default)]
    pub role: MeshRole,

    /// Endpoints a structured-mesh leaf dials at startup
    #[serde(default)]
    pub supernode_list: Vec<String>,

    /// Inbound connection cap under the unstructured mesh
    #[serde(default = "default_max_peer_connections")]
    pub max_peer_connections: usize,
}

fn default_max_peer_connections() -> usize {
    8
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            mesh_type: MeshType::default(),
            role: MeshRole::default(),
            supernode_list: Vec::new(),
            max_peer_connections: default_max_peer_connections(),
        }
    }
}

/// Mesh organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeshType {
    /// Supernode/leaf hierarchy
    Structured,
    /// Flat mesh with a per-node connection cap
    #[default]
    Unstructured,
}

/// Role of a node in a structured mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeshRole {
    Supernode,
    #[default]
    Leaf,
}
