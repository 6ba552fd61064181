/// Shared health context
///
/// Owns every piece of process-wide mutable health state: the DOS tracker,
/// the IP change guard and the node's last known external address. Each is
/// only reached through methods that perform their read-modify-write under
/// a lock, so the context can be shared across tasks behind an `Arc`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::dos_state::DosTracker;
use crate::ip_change_guard::IpChangeGuard;
use crate::lock_utils::lock_or_recover;
use crate::node_list::PeerEndpoint;

#[derive(Debug)]
pub struct HealthContext {
    pub dos: DosTracker,
    pub ip_guard: IpChangeGuard,
    local_endpoint: Mutex<Option<PeerEndpoint>>,
    started_at: Instant,
}

impl HealthContext {
    pub fn new() -> Self {
        Self {
            dos: DosTracker::new(),
            ip_guard: IpChangeGuard::new(),
            local_endpoint: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Process uptime
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Last known external address of this node
    pub fn local_endpoint(&self) -> Option<PeerEndpoint> {
        lock_or_recover(&self.local_endpoint, "local endpoint").clone()
    }

    pub fn set_local_endpoint(&self, endpoint: PeerEndpoint) {
        *lock_or_recover(&self.local_endpoint, "local endpoint") = Some(endpoint);
    }

    /// Store `endpoint` unless an address is already cached. Returns the cached value.
    pub fn local_endpoint_or_insert(&self, endpoint: PeerEndpoint) -> PeerEndpoint {
        lock_or_recover(&self.local_endpoint, "local endpoint")
            .get_or_insert(endpoint)
            .clone()
    }
}

impl Default for HealthContext {
    fn default() -> Self {
        Self::new()
    }
}
