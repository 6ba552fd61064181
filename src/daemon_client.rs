//! HTTP clients for the local benchmark service and node daemon
//!
//! Both services answer with the `{status, data}` envelope. The daemon
//! backs the node list, chain sync, ledger confirmation, connectivity and
//! address-adjustment collaborators.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::collaborators::{
    decode_envelope, AddressAdjuster, BenchmarkInfo, BenchmarkService, ChainSyncStatus,
    CollaboratorError, ConnectionSnapshot, ConnectivityMonitor, LedgerConfirmation,
    NodeListProvider,
};
use crate::node_list::{NodeListEntry, PeerEndpoint};

fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?)
}

async fn get_envelope<T: DeserializeOwned>(
    client: &reqwest::Client,
    service: &str,
    url: &str,
) -> Result<T, CollaboratorError> {
    debug!("GET {}", url);
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await
        .map_err(|e| CollaboratorError::transport(service, e))?
        .json()
        .await
        .map_err(|e| CollaboratorError::decode(service, e))?;
    decode_envelope(service, body)
}

async fn post_envelope<T: DeserializeOwned>(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    payload: serde_json::Value,
) -> Result<T, CollaboratorError> {
    debug!("POST {}", url);
    let body: serde_json::Value = client
        .post(url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| CollaboratorError::transport(service, e))?
        .json()
        .await
        .map_err(|e| CollaboratorError::decode(service, e))?;
    decode_envelope(service, body)
}

// =============================================================================
// BENCHMARK SERVICE
// =============================================================================

pub struct BenchmarkClient {
    client: reqwest::Client,
    base_url: String,
}

impl BenchmarkClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BenchmarkService for BenchmarkClient {
    async fn get_info(&self) -> Result<BenchmarkInfo, CollaboratorError> {
        let url = format!("{}/getinfo", self.base_url);
        get_envelope(&self.client, "benchmark", &url).await
    }

    async fn get_public_ip(&self) -> Result<String, CollaboratorError> {
        let url = format!("{}/getpublicip", self.base_url);
        get_envelope(&self.client, "benchmark", &url).await
    }
}

// =============================================================================
// NODE DAEMON
// =============================================================================

#[derive(Debug, Deserialize)]
struct SyncData {
    synced: bool,
}

pub struct DaemonClient {
    client: reqwest::Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl NodeListProvider for DaemonClient {
    async fn node_list(&self) -> Result<Vec<NodeListEntry>, CollaboratorError> {
        get_envelope(&self.client, "daemon", &self.url("/daemon/nodelist")).await
    }
}

#[async_trait]
impl ChainSyncStatus for DaemonClient {
    async fn is_synced(&self) -> Result<bool, CollaboratorError> {
        let data: SyncData =
            get_envelope(&self.client, "daemon", &self.url("/daemon/syncstatus")).await?;
        Ok(data.synced)
    }
}

#[async_trait]
impl LedgerConfirmation for DaemonClient {
    async fn create_confirmation_transaction(&self) -> Result<String, CollaboratorError> {
        post_envelope(
            &self.client,
            "daemon",
            &self.url("/daemon/confirmation"),
            serde_json::json!({}),
        )
        .await
    }
}

#[async_trait]
impl ConnectivityMonitor for DaemonClient {
    async fn connections(&self) -> Result<ConnectionSnapshot, CollaboratorError> {
        get_envelope(&self.client, "daemon", &self.url("/node/connections")).await
    }
}

#[async_trait]
impl AddressAdjuster for DaemonClient {
    async fn adjust_external_ip(&self, endpoint: &PeerEndpoint) -> Result<(), CollaboratorError> {
        let _: serde_json::Value = post_envelope(
            &self.client,
            "daemon",
            &self.url("/node/adjustip"),
            serde_json::json!({ "ip": endpoint.to_string() }),
        )
        .await?;
        Ok(())
    }
}
