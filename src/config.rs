use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Node health configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub services: ServicesConfig,
    pub availability: AvailabilityConfig,
    pub collision: CollisionConfig,
    pub firewall: FirewallConfig,
    pub rate_limit: RateLimitConfig,
    pub network_policy: NetworkPolicyConfig,
    pub workloads: WorkloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the node API binds to
    pub bind: String,
    /// Public API port announced to the network
    pub api_port: u16,
    /// Ed25519 seed (32 bytes, hex) used to sign outbound reachability requests
    pub identity_key_hex: String,
    /// Collateral outpoint owning this node identity ("txhash:index")
    pub collateral: String,
    /// Hex ed25519 keys allowed to call the reachability endpoint besides listed nodes
    pub admin_public_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Base URL of the local benchmark/probe service
    pub benchmark_url: String,
    /// Base URL of the local daemon (node list, sync, ledger, connectivity)
    pub daemon_url: String,
    /// Timeout for calls to local services
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// Minimum benchmark service version
    pub min_version: String,
    /// Uptime required before a positive check resets the DOS score
    pub min_uptime_secs: u64,
    /// Minimum number of nodes on the network for a full success
    pub min_network_nodes: usize,
    pub min_outgoing: usize,
    pub min_incoming: usize,
    pub min_unique_outgoing_ips: usize,
    pub min_unique_incoming_ips: usize,
    /// Path of the reachability endpoint on peers
    pub reachability_path: String,
    /// Timeout for a single peer reachability call
    pub peer_timeout_secs: u64,
    /// Locally blocked ports
    pub blocked_ports: Vec<u16>,
    /// Locally blocked workload repositories
    pub blocked_repositories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    pub interval_secs: u64,
    pub error_interval_secs: u64,
    /// Delay used while the chain is still syncing
    pub sync_wait_secs: u64,
    /// Node count above which the network counts as mature
    pub maturity_node_count: usize,
    /// Uptime after which availability is checked on an immature network
    pub pre_maturity_uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub use_sudo: bool,
    /// Container isolation chain
    pub chain: String,
    /// Chain that jumps into the isolation chain
    pub parent_chain: String,
    /// Subnet workloads run in
    pub internal_subnet: String,
    /// Local interfaces allowed to talk to themselves
    pub interfaces: Vec<String>,
    /// Private ranges workloads must not reach
    pub private_ranges: Vec<String>,
    pub rebuild_interval_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub token_bucket_capacity: u32,
    pub token_bucket_fill_per_second: f64,
    pub sliding_window_per_second: f64,
    pub sliding_window_capacity: usize,
    pub sliding_window_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicyConfig {
    pub min_port: u16,
    pub max_port: u16,
    pub banned_ports: Vec<u16>,
    pub enterprise_ports: Vec<u16>,
    /// Maximum number of ports a caller may ask us to probe
    pub max_probe_ports: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Command printing one installed workload name per line
    pub list_command: String,
    /// Command removing a workload; `{name}` is substituted
    pub remove_command: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            api_port: 16127,
            identity_key_hex: String::new(),
            collateral: String::new(),
            admin_public_keys: Vec::new(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            benchmark_url: "http://127.0.0.1:16225".to_string(),
            daemon_url: "http://127.0.0.1:16124".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            min_version: "4.0.0".to_string(),
            min_uptime_secs: 1800,
            min_network_nodes: 100,
            min_outgoing: 8,
            min_incoming: 4,
            min_unique_outgoing_ips: 8,
            min_unique_incoming_ips: 4,
            reachability_path: "/node/checkavailability".to_string(),
            peer_timeout_secs: 7,
            blocked_ports: Vec::new(),
            blocked_repositories: Vec::new(),
        }
    }
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            error_interval_secs: 120,
            sync_wait_secs: 240,
            maturity_node_count: 50,
            pre_maturity_uptime_secs: 3600,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(target_os = "linux"),
            use_sudo: true,
            chain: "DOCKER-USER".to_string(),
            parent_chain: "FORWARD".to_string(),
            internal_subnet: "172.23.0.0/16".to_string(),
            interfaces: Vec::new(),
            private_ranges: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
                "100.64.0.0/10".to_string(),
            ],
            rebuild_interval_secs: 3600,
            command_timeout_secs: 900,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            token_bucket_capacity: 15,
            token_bucket_fill_per_second: 10.0,
            sliding_window_per_second: 20.0,
            sliding_window_capacity: 500,
            sliding_window_ttl_secs: 15,
        }
    }
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            min_port: 1,
            max_port: 65535,
            banned_ports: Vec::new(),
            enterprise_ports: Vec::new(),
            max_probe_ports: 20,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            list_command: "docker ps -a --filter label=meshguard.workload --format {{.Names}}"
                .to_string(),
            remove_command: "docker rm -f {name}".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.api_port == 0 {
            anyhow::bail!("Invalid api_port: cannot be 0");
        }

        if !self.node.identity_key_hex.is_empty() {
            let seed = hex::decode(&self.node.identity_key_hex)
                .map_err(|e| anyhow::anyhow!("Invalid identity_key_hex: {}", e))?;
            if seed.len() != 32 {
                anyhow::bail!(
                    "Invalid identity_key_hex: expected 32 bytes, got {}",
                    seed.len()
                );
            }
        }

        if self.network_policy.min_port > self.network_policy.max_port {
            anyhow::bail!(
                "Invalid port range: min_port {} > max_port {}",
                self.network_policy.min_port,
                self.network_policy.max_port
            );
        }

        if self.rate_limit.token_bucket_capacity == 0
            || self.rate_limit.token_bucket_fill_per_second <= 0.0
        {
            anyhow::bail!("Invalid token bucket: capacity and fill rate must be > 0");
        }

        if self.rate_limit.sliding_window_per_second <= 0.0
            || self.rate_limit.sliding_window_capacity == 0
        {
            anyhow::bail!("Invalid sliding window: rate and capacity must be > 0");
        }

        if self.collision.interval_secs == 0 || self.collision.error_interval_secs == 0 {
            anyhow::bail!("Invalid collision intervals: must be > 0");
        }

        Ok(())
    }
}
