//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use meshguard_node::availability::AvailabilityVerifier;
use meshguard_node::collaborators::{
    AddressAdjuster, BenchmarkInfo, BenchmarkService, ChainSyncStatus, CollaboratorError,
    ConnectionSnapshot, ConnectivityMonitor, LedgerConfirmation, NodeListProvider,
    PeerReachability, Reachability, WorkloadManager,
};
use meshguard_node::config::AvailabilityConfig;
use meshguard_node::health::HealthContext;
use meshguard_node::node_list::{NodeListEntry, PeerEndpoint};

pub const PORT: u16 = 16127;
pub const MY_IP: &str = "1.2.3.4";
pub const MY_COLLATERAL: &str = "mine:0";

pub fn entry(ip: &str, collateral: &str, height: u64) -> NodeListEntry {
    NodeListEntry {
        ip: ip.to_string(),
        collateral: collateral.to_string(),
        confirmed_height: height,
        status: "CONFIRMED".to_string(),
        pubkey: String::new(),
    }
}

/// Node list with us plus three peers
pub fn healthy_list() -> Vec<NodeListEntry> {
    vec![
        entry(MY_IP, MY_COLLATERAL, 100),
        entry("10.0.0.2", "b:0", 101),
        entry("10.0.0.3", "c:0", 102),
        entry("10.0.0.4:16137", "d:0", 103),
    ]
}

pub fn transport_error() -> CollaboratorError {
    CollaboratorError::transport("peer", "connection refused")
}

// =============================================================================
// BENCHMARK
// =============================================================================

pub struct FakeBenchmark {
    pub version: Mutex<Result<String, CollaboratorError>>,
    /// Successive public IP answers; the last one repeats
    pub public_ips: Mutex<VecDeque<Result<String, CollaboratorError>>>,
    pub ip_calls: AtomicUsize,
}

impl FakeBenchmark {
    pub fn new(version: &str, ips: Vec<Result<String, CollaboratorError>>) -> Arc<Self> {
        Arc::new(Self {
            version: Mutex::new(Ok(version.to_string())),
            public_ips: Mutex::new(ips.into()),
            ip_calls: AtomicUsize::new(0),
        })
    }

    pub fn fixed(ip: &str) -> Arc<Self> {
        Self::new("4.2.0", vec![Ok(ip.to_string())])
    }

    pub fn set_version(&self, version: Result<String, CollaboratorError>) {
        *self.version.lock().unwrap() = version;
    }
}

#[async_trait]
impl BenchmarkService for FakeBenchmark {
    async fn get_info(&self) -> Result<BenchmarkInfo, CollaboratorError> {
        self.version
            .lock()
            .unwrap()
            .clone()
            .map(|version| BenchmarkInfo { version })
    }

    async fn get_public_ip(&self) -> Result<String, CollaboratorError> {
        self.ip_calls.fetch_add(1, Ordering::SeqCst);
        let mut ips = self.public_ips.lock().unwrap();
        if ips.len() > 1 {
            ips.pop_front().unwrap()
        } else {
            ips.front()
                .cloned()
                .unwrap_or_else(|| Err(CollaboratorError::transport("benchmark", "no answer")))
        }
    }
}

// =============================================================================
// NODE LIST / SYNC / LEDGER
// =============================================================================

pub struct FakeNodeList {
    pub list: Mutex<Result<Vec<NodeListEntry>, CollaboratorError>>,
}

impl FakeNodeList {
    pub fn new(list: Vec<NodeListEntry>) -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(Ok(list)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(Err(CollaboratorError::transport("daemon", "down"))),
        })
    }
}

#[async_trait]
impl NodeListProvider for FakeNodeList {
    async fn node_list(&self) -> Result<Vec<NodeListEntry>, CollaboratorError> {
        self.list.lock().unwrap().clone()
    }
}

pub struct FakeSync(pub bool);

#[async_trait]
impl ChainSyncStatus for FakeSync {
    async fn is_synced(&self) -> Result<bool, CollaboratorError> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct FakeLedger {
    pub calls: AtomicUsize,
}

#[async_trait]
impl LedgerConfirmation for FakeLedger {
    async fn create_confirmation_transaction(&self) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("txid-1".to_string())
    }
}

// =============================================================================
// PEERS
// =============================================================================

pub struct FakePeers {
    /// Successive replies; the last one repeats
    pub replies: Mutex<VecDeque<Result<Reachability, CollaboratorError>>>,
    pub calls: AtomicUsize,
    pub asked: Mutex<Vec<PeerEndpoint>>,
    /// Nodes answering `is_node_reachable`
    pub alive: Vec<PeerEndpoint>,
}

impl FakePeers {
    pub fn new(replies: Vec<Result<Reachability, CollaboratorError>>) -> Arc<Self> {
        Self::with_alive(replies, Vec::new())
    }

    pub fn with_alive(
        replies: Vec<Result<Reachability, CollaboratorError>>,
        alive: Vec<PeerEndpoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
            alive,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerReachability for FakePeers {
    async fn check_reachability(
        &self,
        peer: &PeerEndpoint,
        _probe: &PeerEndpoint,
    ) -> Result<Reachability, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.asked.lock().unwrap().push(peer.clone());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies.front().cloned().unwrap_or(Ok(Reachability::Reachable))
        }
    }

    async fn is_node_reachable(&self, node: &PeerEndpoint) -> bool {
        self.alive.iter().any(|a| a.same_node(node, PORT))
    }
}

// =============================================================================
// CONNECTIVITY / ADDRESS / WORKLOADS
// =============================================================================

pub struct FakeConnectivity(pub Mutex<ConnectionSnapshot>);

impl FakeConnectivity {
    pub fn with_peers(outgoing: usize, incoming: usize) -> Arc<Self> {
        Arc::new(Self(Mutex::new(ConnectionSnapshot {
            outgoing: (0..outgoing).map(|i| format!("20.0.0.{}:16125", i)).collect(),
            incoming: (0..incoming).map(|i| format!("30.0.0.{}:40000", i)).collect(),
        })))
    }
}

#[async_trait]
impl ConnectivityMonitor for FakeConnectivity {
    async fn connections(&self) -> Result<ConnectionSnapshot, CollaboratorError> {
        Ok(self.0.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeAdjuster {
    pub adjusted: Mutex<Vec<PeerEndpoint>>,
}

#[async_trait]
impl AddressAdjuster for FakeAdjuster {
    async fn adjust_external_ip(&self, endpoint: &PeerEndpoint) -> Result<(), CollaboratorError> {
        self.adjusted.lock().unwrap().push(endpoint.clone());
        Ok(())
    }
}

pub struct FakeWorkloads {
    pub names: Vec<String>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeWorkloads {
    pub fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            removed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WorkloadManager for FakeWorkloads {
    async fn installed(&self) -> Result<Vec<String>, CollaboratorError> {
        Ok(self.names.clone())
    }

    async fn remove(&self, name: &str) -> Result<(), CollaboratorError> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// Availability settings a healthy test node satisfies
pub fn test_availability_config() -> AvailabilityConfig {
    AvailabilityConfig {
        min_version: "4.0.0".to_string(),
        min_uptime_secs: 0,
        min_network_nodes: 2,
        min_outgoing: 2,
        min_incoming: 1,
        min_unique_outgoing_ips: 2,
        min_unique_incoming_ips: 1,
        ..AvailabilityConfig::default()
    }
}

pub struct Harness {
    pub ctx: Arc<HealthContext>,
    pub config: AvailabilityConfig,
    pub benchmark: Arc<FakeBenchmark>,
    pub node_list: Arc<FakeNodeList>,
    pub peers: Arc<FakePeers>,
    pub connectivity: Arc<FakeConnectivity>,
    pub adjuster: Arc<FakeAdjuster>,
    pub workloads: Arc<FakeWorkloads>,
}

impl Harness {
    pub fn new(peers: Arc<FakePeers>) -> Self {
        Self {
            ctx: Arc::new(HealthContext::new()),
            config: test_availability_config(),
            benchmark: FakeBenchmark::fixed(MY_IP),
            node_list: FakeNodeList::new(healthy_list()),
            peers,
            connectivity: FakeConnectivity::with_peers(4, 2),
            adjuster: Arc::new(FakeAdjuster::default()),
            workloads: FakeWorkloads::new(&["web", "db"]),
        }
    }

    pub fn verifier(&self) -> AvailabilityVerifier {
        AvailabilityVerifier::new(
            self.ctx.clone(),
            self.config.clone(),
            PORT,
            self.benchmark.clone(),
            self.node_list.clone(),
            self.peers.clone(),
            self.connectivity.clone(),
            self.adjuster.clone(),
            self.workloads.clone(),
        )
        .with_retry_delay(std::time::Duration::ZERO)
    }
}
