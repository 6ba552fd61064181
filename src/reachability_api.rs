/// Node API
///
/// Exposes the endpoint peers use to verify our reachability claims about
/// them, plus read-only health endpoints for operators:
/// - GET /node/health
/// - GET /node/dosstate
/// - GET <reachability path>?ip&port[&ports]&pubkey&timestamp&signature
///
/// Every request passes the per-IP sliding window limiter. The reachability
/// route opens outbound TCP connections, so it also spends a token from the
/// per-IP token bucket and only serves signed requests from admin keys or
/// listed nodes.

use anyhow::Result;
use async_trait::async_trait;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::collaborators::{MessageData, NodeListProvider, ServiceResponse};
use crate::config::{Config, NetworkPolicyConfig};
use crate::health::HealthContext;
use crate::node_list::contains_pubkey;
use crate::peer_client::{signing_payload, verify_payload, MAX_SIGNATURE_AGE_MS};
use crate::rate_limit::{SlidingWindowLimiter, TokenBucketLimiter};

/// Timeout for a single outbound port probe
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// PORT PROBING
// =============================================================================

#[async_trait]
pub trait PortProber: Send + Sync {
    /// Whether `ip:port` accepts a connection
    async fn probe(&self, ip: IpAddr, port: u16) -> bool;
}

/// TCP connect prober
pub struct TcpPortProber {
    timeout: Duration,
}

impl TcpPortProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpPortProber {
    fn default() -> Self {
        Self::new(PORT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl PortProber for TcpPortProber {
    async fn probe(&self, ip: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(ip, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", addr);
                false
            }
        }
    }
}

// =============================================================================
// API HANDLER
// =============================================================================

/// Parsed and authenticated reachability request
#[derive(Debug)]
struct ReachabilityRequest {
    ip: IpAddr,
    ports: Vec<u16>,
}

pub struct NodeApi {
    ctx: Arc<HealthContext>,
    policy: NetworkPolicyConfig,
    admin_keys: Vec<String>,
    reachability_path: String,
    node_list: Arc<dyn NodeListProvider>,
    prober: Arc<dyn PortProber>,
    window: SlidingWindowLimiter,
    buckets: TokenBucketLimiter,
}

impl NodeApi {
    pub fn new(
        ctx: Arc<HealthContext>,
        config: &Config,
        node_list: Arc<dyn NodeListProvider>,
        prober: Arc<dyn PortProber>,
    ) -> Self {
        let limits = &config.rate_limit;
        Self {
            ctx,
            policy: config.network_policy.clone(),
            admin_keys: config.node.admin_public_keys.clone(),
            reachability_path: config.availability.reachability_path.clone(),
            node_list,
            prober,
            window: SlidingWindowLimiter::new(
                limits.sliding_window_per_second,
                limits.sliding_window_capacity,
                Duration::from_secs(limits.sliding_window_ttl_secs),
            ),
            buckets: TokenBucketLimiter::new(
                limits.token_bucket_capacity,
                limits.token_bucket_fill_per_second,
            ),
        }
    }

    /// Drop sliding window entries idle past their TTL
    pub fn purge_rate_limits(&self) -> usize {
        self.window.purge_expired(Instant::now())
    }

    /// Handle one request from `remote`
    pub async fn handle_request(&self, req: Request<Body>, remote: IpAddr) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let method = req.method().clone();

        debug!("Node API request from {}: {} {}", remote, method, path);

        if !self.window.check(remote) {
            warn!("Rate limited {} on {}", remote, path);
            return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        }

        match (method, path.as_str()) {
            (Method::GET, "/node/health") => self.handle_health(),
            (Method::GET, "/node/dosstate") => self.handle_dos_state(),
            (Method::GET, p) if p == self.reachability_path => {
                self.handle_reachability(&query, remote).await
            }
            _ => error_response(StatusCode::NOT_FOUND, "Endpoint not found"),
        }
    }

    fn handle_health(&self) -> Result<Response<Body>> {
        json_response(
            StatusCode::OK,
            &ServiceResponse::success(serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_secs": self.ctx.uptime().as_secs(),
            })),
        )
    }

    fn handle_dos_state(&self) -> Result<Response<Body>> {
        json_response(StatusCode::OK, &ServiceResponse::success(self.ctx.dos.state()))
    }

    async fn handle_reachability(&self, query: &str, remote: IpAddr) -> Result<Response<Body>> {
        if !self.buckets.take(remote) {
            warn!("Probe budget exhausted for {}", remote);
            return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many probe requests");
        }

        let request = match self.authorize(query, remote).await {
            Ok(request) => request,
            Err((status, message)) => {
                warn!("Rejected reachability request from {}: {}", remote, message);
                return error_response(status, &message);
            }
        };

        let mut closed = Vec::new();
        for port in &request.ports {
            if !self.prober.probe(request.ip, *port).await {
                closed.push(port.to_string());
            }
        }

        if closed.is_empty() {
            let ports: Vec<String> = request.ports.iter().map(u16::to_string).collect();
            info!("Node {} reachable on {}", request.ip, ports.join(","));
            json_response(
                StatusCode::OK,
                &ServiceResponse::success(MessageData::new(format!(
                    "Node {} is reachable on ports {}",
                    request.ip,
                    ports.join(",")
                ))),
            )
        } else {
            info!("Node {} unreachable on {}", request.ip, closed.join(","));
            json_response(
                StatusCode::OK,
                &ServiceResponse::error(MessageData::new(format!(
                    "Node {} is not reachable on ports {}",
                    request.ip,
                    closed.join(",")
                ))),
            )
        }
    }

    async fn authorize(
        &self,
        query: &str,
        remote: IpAddr,
    ) -> std::result::Result<ReachabilityRequest, (StatusCode, String)> {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let param = |name: &str| {
            params
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Missing parameter '{}'", name)))
        };

        let ip_raw = param("ip")?;
        let ip: IpAddr = ip_raw
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid ip '{}'", ip_raw)))?;
        let port: u16 = param("port")?
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid port".to_string()))?;
        let pubkey = param("pubkey")?;
        let signature = param("signature")?;
        let timestamp: i64 = param("timestamp")?
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid timestamp".to_string()))?;

        if ip != remote {
            return Err((
                StatusCode::FORBIDDEN,
                format!("Probes are only performed against the caller ({})", remote),
            ));
        }

        let age = chrono::Utc::now().timestamp_millis() - timestamp;
        if age.abs() > MAX_SIGNATURE_AGE_MS {
            return Err((StatusCode::UNAUTHORIZED, "Signature expired".to_string()));
        }

        if !verify_payload(pubkey, signature, &signing_payload(ip_raw, port, timestamp)) {
            return Err((StatusCode::UNAUTHORIZED, "Invalid signature".to_string()));
        }

        if !self.is_trusted_key(pubkey).await? {
            return Err((StatusCode::FORBIDDEN, "Unknown public key".to_string()));
        }

        let ports = match params.get("ports").filter(|v| !v.is_empty()) {
            Some(list) => list
                .split(',')
                .map(|p| p.trim().parse::<u16>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid ports list".to_string()))?,
            None => vec![port],
        };

        if ports.len() > self.policy.max_probe_ports {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("At most {} ports may be probed", self.policy.max_probe_ports),
            ));
        }

        if let Some(denied) = ports.iter().find(|p| !self.port_allowed(**p)) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Port {} is outside the allowed policy", denied),
            ));
        }

        Ok(ReachabilityRequest { ip, ports })
    }

    async fn is_trusted_key(&self, pubkey: &str) -> std::result::Result<bool, (StatusCode, String)> {
        if self.admin_keys.iter().any(|k| k.eq_ignore_ascii_case(pubkey)) {
            return Ok(true);
        }

        let list = self.node_list.node_list().await.map_err(|e| {
            error!("Node list unavailable for key check: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Node list unavailable".to_string(),
            )
        })?;
        Ok(contains_pubkey(&list, pubkey))
    }

    fn port_allowed(&self, port: u16) -> bool {
        port >= self.policy.min_port
            && port <= self.policy.max_port
            && !self.policy.banned_ports.contains(&port)
            && !self.policy.enterprise_ports.contains(&port)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(body)?))?)
}

fn error_response(status: StatusCode, message: &str) -> Result<Response<Body>> {
    json_response(status, &ServiceResponse::error(MessageData::new(message)))
}

// =============================================================================
// SERVER
// =============================================================================

/// Serve the node API until `shutdown` flips
pub async fn run_node_api(
    addr: SocketAddr,
    api: Arc<NodeApi>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("Starting node API on {}", addr);

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let api = api.clone();
        let remote = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = api.clone();
                async move {
                    match api.handle_request(req, remote).await {
                        Ok(response) => Ok::<_, Infallible>(response),
                        Err(e) => {
                            error!("Node API error: {}", e);
                            let body = ServiceResponse::error(MessageData::new("Internal server error"));
                            Ok(Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .header("Content-Type", "application/json")
                                .body(Body::from(serde_json::to_string(&body).unwrap_or_default()))
                                .unwrap())
                        }
                    }
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        });
    server.await?;

    info!("Node API stopped");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
