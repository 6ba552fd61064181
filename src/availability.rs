/// Availability Verifier
///
/// Answers "can the rest of the network reach me?" by asking a randomly
/// chosen peer from the deterministic node list to probe this node. Each
/// failed attempt costs DOS points; attempts are bounded by
/// [`MAX_ATTEMPTS`] and cut short once the score crosses the DOS threshold.
///
/// A confirmed reachability only resets the DOS score when the node is also
/// mature (uptime, network size, listed in the node list) and well
/// connected. Insufficient connectivity accrues a small penalty per
/// evaluation instead, so a node that nobody connects to drifts into DOS
/// over roughly an hour and a quarter rather than immediately.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collaborators::{
    AddressAdjuster, BenchmarkService, ConnectivityMonitor, NodeListProvider, PeerReachability,
    Reachability, WorkloadManager,
};
use crate::config::AvailabilityConfig;
use crate::health::HealthContext;
use crate::ip_change_guard::teardown_workloads;
use crate::node_list::{contains_endpoint, NodeListEntry, PeerEndpoint};
use crate::version_gate;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Hard ceiling on peer attempts per verification
pub const MAX_ATTEMPTS: u32 = 6;

/// Attempt index at which the public address is re-checked
pub const ADDRESS_RECHECK_ATTEMPT: u32 = 4;

/// Caps on locally configured block lists
pub const MAX_BLOCKED_PORTS: usize = 100;
pub const MAX_BLOCKED_REPOSITORIES: usize = 10;

pub const PEER_FAILURE_PENALTY: f64 = 2.0;
pub const BENCHMARK_UNAVAILABLE_PENALTY: f64 = 2.0;
pub const BENCHMARK_OUTDATED_PENALTY: f64 = 11.0;
pub const ADDRESS_UNCHANGED_PENALTY: f64 = 2.0;
pub const ADDRESS_PROBE_ERROR_PENALTY: f64 = 15.0;

/// Per-evaluation penalty while connectivity is insufficient
pub const CONNECTIVITY_PENALTY: f64 = 0.13;

/// Default pause between peer attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// OUTCOME
// =============================================================================

/// Why a verification was rejected before asking any peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooManyIpChanges,
    TooManyBlockedPorts(usize),
    TooManyBlockedRepositories(usize),
    BenchmarkUnavailable,
    BenchmarkOutdated(String),
    NoPublicAddress,
    NodeListUnavailable,
    NoPeers,
}

/// Result of one verification
#[derive(Debug, Clone, PartialEq)]
pub enum AvailabilityOutcome {
    /// A peer confirmed reachability. `full` means every maturity and
    /// connectivity condition held and the DOS score was reset.
    Available { full: bool },
    /// The public address changed; assumed to fix reachability next cycle
    AddressRotated(PeerEndpoint),
    /// Reachable, but the standing DOS score suppresses a positive answer
    Suppressed,
    Rejected(RejectReason),
    /// Peers could not confirm reachability
    Unavailable { attempts: u32 },
}

impl AvailabilityOutcome {
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            AvailabilityOutcome::Available { .. } | AvailabilityOutcome::AddressRotated(_)
        )
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

pub struct AvailabilityVerifier {
    ctx: Arc<HealthContext>,
    config: AvailabilityConfig,
    default_port: u16,
    benchmark: Arc<dyn BenchmarkService>,
    node_list: Arc<dyn NodeListProvider>,
    peers: Arc<dyn PeerReachability>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    adjuster: Arc<dyn AddressAdjuster>,
    workloads: Arc<dyn WorkloadManager>,
    retry_delay: Duration,
}

impl AvailabilityVerifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<HealthContext>,
        config: AvailabilityConfig,
        default_port: u16,
        benchmark: Arc<dyn BenchmarkService>,
        node_list: Arc<dyn NodeListProvider>,
        peers: Arc<dyn PeerReachability>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        adjuster: Arc<dyn AddressAdjuster>,
        workloads: Arc<dyn WorkloadManager>,
    ) -> Self {
        Self {
            ctx,
            config,
            default_port,
            benchmark,
            node_list,
            peers,
            connectivity,
            adjuster,
            workloads,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the pause between peer attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Boolean view of [`AvailabilityVerifier::verify`]
    pub async fn check_my_availability(&self) -> bool {
        self.verify().await.is_available()
    }

    /// Run one full verification including its retries
    pub async fn verify(&self) -> AvailabilityOutcome {
        if self.ctx.ip_guard.is_over_limit() {
            return AvailabilityOutcome::Rejected(RejectReason::TooManyIpChanges);
        }

        if let Some(reason) = self.check_block_list_caps() {
            return AvailabilityOutcome::Rejected(reason);
        }

        if let Some(reason) = self.check_benchmark().await {
            return AvailabilityOutcome::Rejected(reason);
        }

        let me = match self.resolve_local_endpoint().await {
            Some(endpoint) => endpoint,
            None => return AvailabilityOutcome::Rejected(RejectReason::NoPublicAddress),
        };

        let list = match self.node_list.node_list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Node list unavailable for availability check: {}", e);
                return AvailabilityOutcome::Rejected(RejectReason::NodeListUnavailable);
            }
        };

        let candidates: Vec<PeerEndpoint> = list
            .iter()
            .filter_map(NodeListEntry::endpoint)
            .filter(|endpoint| !endpoint.same_node(&me, self.default_port))
            .collect();

        if candidates.is_empty() {
            warn!("No peers available to verify reachability of {}", me);
            return AvailabilityOutcome::Rejected(RejectReason::NoPeers);
        }

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }

            let peer = {
                let mut rng = rand::thread_rng();
                candidates.choose(&mut rng).cloned()
            };
            let Some(peer) = peer else {
                return AvailabilityOutcome::Rejected(RejectReason::NoPeers);
            };

            debug!("Availability attempt {} via {}", attempt + 1, peer);

            match self.peers.check_reachability(&peer, &me).await {
                Err(e) => {
                    let score = self.ctx.dos.add_penalty(
                        PEER_FAILURE_PENALTY,
                        &format!("Availability check via {} failed: {}", peer, e),
                    );
                    if score > crate::dos_state::DOS_THRESHOLD {
                        return AvailabilityOutcome::Unavailable {
                            attempts: attempt + 1,
                        };
                    }
                }
                Ok(Reachability::Unreachable(message)) => {
                    self.ctx.dos.add_penalty(
                        PEER_FAILURE_PENALTY,
                        &format!("Node {} not reachable from {}: {}", me, peer, message),
                    );

                    if attempt == ADDRESS_RECHECK_ATTEMPT || self.ctx.dos.exceeds_threshold() {
                        if let Some(outcome) = self.recheck_public_address(&me).await {
                            return outcome;
                        }
                    }

                    if self.ctx.dos.exceeds_threshold() {
                        return AvailabilityOutcome::Unavailable {
                            attempts: attempt + 1,
                        };
                    }
                }
                Ok(Reachability::Reachable) => {
                    return self.evaluate_confirmed(&me, &list).await;
                }
            }
        }

        warn!(
            "Availability of {} not confirmed after {} attempts",
            me, MAX_ATTEMPTS
        );
        AvailabilityOutcome::Unavailable {
            attempts: MAX_ATTEMPTS,
        }
    }

    fn check_block_list_caps(&self) -> Option<RejectReason> {
        let ports = self.config.blocked_ports.len();
        if ports > MAX_BLOCKED_PORTS {
            self.ctx.dos.flag(&format!(
                "{} blocked ports configured, maximum is {}",
                ports, MAX_BLOCKED_PORTS
            ));
            return Some(RejectReason::TooManyBlockedPorts(ports));
        }

        let repos = self.config.blocked_repositories.len();
        if repos > MAX_BLOCKED_REPOSITORIES {
            self.ctx.dos.flag(&format!(
                "{} blocked repositories configured, maximum is {}",
                repos, MAX_BLOCKED_REPOSITORIES
            ));
            return Some(RejectReason::TooManyBlockedRepositories(repos));
        }
        None
    }

    async fn check_benchmark(&self) -> Option<RejectReason> {
        match self.benchmark.get_info().await {
            Err(e) => {
                self.ctx.dos.add_penalty(
                    BENCHMARK_UNAVAILABLE_PENALTY,
                    &format!("Benchmark service not responding: {}", e),
                );
                Some(RejectReason::BenchmarkUnavailable)
            }
            Ok(info) if !version_gate::satisfies(&info.version, &self.config.min_version) => {
                self.ctx.dos.add_penalty(
                    BENCHMARK_OUTDATED_PENALTY,
                    &format!(
                        "Benchmark version {} is below required {}",
                        info.version, self.config.min_version
                    ),
                );
                Some(RejectReason::BenchmarkOutdated(info.version))
            }
            Ok(_) => None,
        }
    }

    async fn resolve_local_endpoint(&self) -> Option<PeerEndpoint> {
        if let Some(endpoint) = self.ctx.local_endpoint() {
            return Some(endpoint);
        }

        match self.benchmark.get_public_ip().await {
            Ok(raw) => match PeerEndpoint::parse(&raw) {
                Some(endpoint) => Some(self.ctx.local_endpoint_or_insert(endpoint)),
                None => {
                    warn!("Benchmark reported unparseable address '{}'", raw);
                    None
                }
            },
            Err(e) => {
                self.ctx.dos.add_penalty(
                    BENCHMARK_UNAVAILABLE_PENALTY,
                    &format!("Unable to determine public address: {}", e),
                );
                None
            }
        }
    }

    /// Reconcile an address observed outside the verifier with the cache.
    ///
    /// The first observation fills the cache. A different address is
    /// treated as a rotation and counted by the IP change guard. Returns an
    /// outcome only when the address moved.
    pub async fn adopt_observed_address(
        &self,
        observed: &PeerEndpoint,
    ) -> Option<AvailabilityOutcome> {
        let cached = self.ctx.local_endpoint_or_insert(observed.clone());
        if cached.same_node(observed, self.default_port) {
            return None;
        }
        Some(self.handle_address_rotation(&cached, observed.clone()).await)
    }

    /// Ask the benchmark service whether our address moved.
    ///
    /// Returns an outcome only when the verification should stop here.
    async fn recheck_public_address(&self, me: &PeerEndpoint) -> Option<AvailabilityOutcome> {
        match self.benchmark.get_public_ip().await {
            Ok(raw) => match PeerEndpoint::parse(&raw) {
                Some(observed) if !observed.same_node(me, self.default_port) => {
                    Some(self.handle_address_rotation(me, observed).await)
                }
                Some(_) => {
                    self.ctx.dos.add_penalty(
                        ADDRESS_UNCHANGED_PENALTY,
                        &format!("Node {} unreachable and public address unchanged", me),
                    );
                    None
                }
                None => {
                    self.ctx.dos.add_penalty(
                        ADDRESS_PROBE_ERROR_PENALTY,
                        &format!("Benchmark reported unparseable address '{}'", raw),
                    );
                    None
                }
            },
            Err(e) => {
                self.ctx.dos.add_penalty(
                    ADDRESS_PROBE_ERROR_PENALTY,
                    &format!("Public address check failed: {}", e),
                );
                None
            }
        }
    }

    async fn handle_address_rotation(
        &self,
        previous: &PeerEndpoint,
        observed: PeerEndpoint,
    ) -> AvailabilityOutcome {
        info!("Public address changed from {} to {}", previous, observed);

        if self.ctx.ip_guard.changes_over_limit() {
            self.ctx
                .dos
                .flag("Too many IP changes within 20 hours, local workloads removed");
            let report = teardown_workloads(self.workloads.as_ref()).await;
            warn!(
                "Workload teardown after IP change limit: {} removed, {} failed",
                report.removed.len(),
                report.failed.len()
            );
            return AvailabilityOutcome::Rejected(RejectReason::TooManyIpChanges);
        }

        self.ctx.set_local_endpoint(observed.clone());
        if let Err(e) = self.adjuster.adjust_external_ip(&observed).await {
            warn!("Failed to propagate new address {}: {}", observed, e);
        }
        AvailabilityOutcome::AddressRotated(observed)
    }

    async fn evaluate_confirmed(
        &self,
        me: &PeerEndpoint,
        list: &[NodeListEntry],
    ) -> AvailabilityOutcome {
        let uptime_ok = self.ctx.uptime() >= Duration::from_secs(self.config.min_uptime_secs);
        let network_ok = list.len() > self.config.min_network_nodes;
        let listed = contains_endpoint(list, me, self.default_port);

        let connectivity_ok = if uptime_ok && network_ok {
            let ok = self.connectivity_sufficient().await;
            if !ok {
                self.ctx.dos.add_penalty(
                    CONNECTIVITY_PENALTY,
                    "Not enough peer connections to the network",
                );
            }
            ok
        } else {
            false
        };

        let full = uptime_ok
            && network_ok
            && listed
            && connectivity_ok
            && !self.ctx.ip_guard.is_over_limit();

        // A clean check clears any score short of a latched collision
        if full && self.ctx.dos.reset() {
            return AvailabilityOutcome::Available { full: true };
        }

        if self.ctx.dos.exceeds_threshold() {
            return AvailabilityOutcome::Suppressed;
        }

        debug!(
            "Reachable but not fully verified (uptime_ok={}, network_ok={}, listed={}, connectivity_ok={})",
            uptime_ok, network_ok, listed, connectivity_ok
        );
        AvailabilityOutcome::Available { full: false }
    }

    async fn connectivity_sufficient(&self) -> bool {
        let snapshot = match self.connectivity.connections().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Connection counts unavailable: {}", e);
                return false;
            }
        };

        snapshot.outgoing.len() >= self.config.min_outgoing
            && snapshot.incoming.len() >= self.config.min_incoming
            && snapshot.unique_outgoing_ips() >= self.config.min_unique_outgoing_ips
            && snapshot.unique_incoming_ips() >= self.config.min_unique_incoming_ips
    }
}
