/// External collaborator interfaces
///
/// The health layer never talks to the benchmark service, the daemon, the
/// ledger or remote peers directly; it goes through these narrow traits so
/// the verifier and detector can be driven by in-memory fakes in tests.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::node_list::{NodeListEntry, PeerEndpoint};

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from any external collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{service} request failed: {message}")]
    Transport { service: String, message: String },

    #[error("{service} returned error status: {message}")]
    Status { service: String, message: String },

    #[error("Invalid response from {service}: {message}")]
    Decode { service: String, message: String },
}

impl CollaboratorError {
    pub fn transport(service: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            service: service.to_string(),
            message: err.to_string(),
        }
    }

    pub fn decode(service: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

// =============================================================================
// RESPONSE ENVELOPE
// =============================================================================

/// `{status, data}` envelope used by local services and peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
    pub status: String,
    pub data: T,
}

impl<T> ServiceResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data,
        }
    }

    pub fn error(data: T) -> Self {
        Self {
            status: "error".to_string(),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Payload carrying a human readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub message: String,
}

impl MessageData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Decode an envelope, failing on a non-success status
pub fn decode_envelope<T: DeserializeOwned>(
    service: &str,
    body: serde_json::Value,
) -> Result<T, CollaboratorError> {
    let envelope: ServiceResponse<serde_json::Value> =
        serde_json::from_value(body).map_err(|e| CollaboratorError::decode(service, e))?;

    if !envelope.is_success() {
        return Err(CollaboratorError::Status {
            service: service.to_string(),
            message: message_of(&envelope.data),
        });
    }

    serde_json::from_value(envelope.data).map_err(|e| CollaboratorError::decode(service, e))
}

/// Best-effort message extraction from an envelope's `data`
pub fn message_of(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        other => other.to_string(),
    }
}

// =============================================================================
// PEER REACHABILITY
// =============================================================================

/// A peer's answer to "can you reach me?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable(String),
}

impl Reachability {
    /// Interpret a peer's reply.
    ///
    /// Peers signal unreachability either with an `error` status or with a
    /// message containing "not"; both are honoured for compatibility.
    pub fn from_reply(status: &str, message: &str) -> Self {
        if status == "error" || message.contains("not") {
            Reachability::Unreachable(message.to_string())
        } else {
            Reachability::Reachable
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Reachability::Reachable)
    }
}

#[async_trait]
pub trait PeerReachability: Send + Sync {
    /// Ask `peer` whether it can reach `probe`
    async fn check_reachability(
        &self,
        peer: &PeerEndpoint,
        probe: &PeerEndpoint,
    ) -> Result<Reachability, CollaboratorError>;

    /// Whether a node answers on its API at all
    async fn is_node_reachable(&self, node: &PeerEndpoint) -> bool;
}

// =============================================================================
// LOCAL SERVICES
// =============================================================================

/// Benchmark/probe service information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkInfo {
    pub version: String,
}

#[async_trait]
pub trait BenchmarkService: Send + Sync {
    async fn get_info(&self) -> Result<BenchmarkInfo, CollaboratorError>;

    /// Publicly observed address (`ip` or `ip:port`)
    async fn get_public_ip(&self) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait NodeListProvider: Send + Sync {
    async fn node_list(&self) -> Result<Vec<NodeListEntry>, CollaboratorError>;
}

#[async_trait]
pub trait ChainSyncStatus: Send + Sync {
    async fn is_synced(&self) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait LedgerConfirmation: Send + Sync {
    /// Reassert ownership of this node's collateral. Returns a transaction id.
    async fn create_confirmation_transaction(&self) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait AddressAdjuster: Send + Sync {
    /// Persist and broadcast the node's confirmed external address
    async fn adjust_external_ip(&self, endpoint: &PeerEndpoint) -> Result<(), CollaboratorError>;
}

/// Current peer connections (remote addresses)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default)]
    pub incoming: Vec<String>,
}

impl ConnectionSnapshot {
    pub fn unique_outgoing_ips(&self) -> usize {
        unique_hosts(&self.outgoing)
    }

    pub fn unique_incoming_ips(&self) -> usize {
        unique_hosts(&self.incoming)
    }
}

fn unique_hosts(addresses: &[String]) -> usize {
    addresses
        .iter()
        .map(|a| {
            PeerEndpoint::parse(a)
                .map(|e| e.ip)
                .unwrap_or_else(|| a.clone())
        })
        .collect::<HashSet<_>>()
        .len()
}

#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    async fn connections(&self) -> Result<ConnectionSnapshot, CollaboratorError>;
}

#[async_trait]
pub trait WorkloadManager: Send + Sync {
    /// Names of locally installed workloads
    async fn installed(&self) -> Result<Vec<String>, CollaboratorError>;

    async fn remove(&self, name: &str) -> Result<(), CollaboratorError>;
}
