// Library interface for MeshGuard node health components
// Allows testing the verifier, detector and limiters without the binary

pub mod availability;
pub mod collaborators;
pub mod collision;
pub mod config;
pub mod daemon_client;
pub mod dos_state;
pub mod firewall;
pub mod health;
pub mod ip_change_guard;
pub mod lock_utils;
pub mod node_list;
pub mod peer_client;
pub mod rate_limit;
pub mod reachability_api;
pub mod shell;
pub mod version_gate;
