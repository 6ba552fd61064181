/// Outbound peer calls
///
/// Asks a remote node whether it can reach us. Requests are signed with the
/// node's ed25519 identity so the remote side can tell network members from
/// random callers before spending effort on port probes.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::time::Duration;
use tracing::debug;

use crate::collaborators::{message_of, CollaboratorError, PeerReachability, Reachability};
use crate::node_list::PeerEndpoint;

/// Maximum age of a signed request timestamp
pub const MAX_SIGNATURE_AGE_MS: i64 = 5 * 60 * 1000;

/// Payload covered by a reachability request signature
pub fn signing_payload(ip: &str, port: u16, timestamp_ms: i64) -> String {
    format!("{}:{}:{}", ip, port, timestamp_ms)
}

/// Sign a payload, returning the hex signature
pub fn sign_payload(key: &SigningKey, payload: &str) -> String {
    hex::encode(key.sign(payload.as_bytes()).to_bytes())
}

/// Verify a hex signature against a hex public key
pub fn verify_payload(pubkey_hex: &str, signature_hex: &str, payload: &str) -> bool {
    let Ok(key_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(key_array): Result<[u8; 32], _> = key_bytes.try_into() else {
        return false;
    };
    let Ok(public_key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);

    public_key.verify(payload.as_bytes(), &signature).is_ok()
}

/// HTTP implementation of [`PeerReachability`]
pub struct HttpPeerClient {
    client: reqwest::Client,
    signing_key: SigningKey,
    reachability_path: String,
    default_port: u16,
}

impl HttpPeerClient {
    pub fn new(
        signing_key: SigningKey,
        reachability_path: &str,
        default_port: u16,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            signing_key,
            reachability_path: reachability_path.to_string(),
            default_port,
        })
    }

    /// Hex public key peers see on our requests
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    fn signed_query(&self, probe: &PeerEndpoint) -> Vec<(&'static str, String)> {
        let port = probe.port_or(self.default_port);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let payload = signing_payload(&probe.ip, port, timestamp);

        vec![
            ("ip", probe.ip.clone()),
            ("port", port.to_string()),
            ("pubkey", self.public_key_hex()),
            ("timestamp", timestamp.to_string()),
            ("signature", sign_payload(&self.signing_key, &payload)),
        ]
    }
}

#[async_trait]
impl PeerReachability for HttpPeerClient {
    async fn check_reachability(
        &self,
        peer: &PeerEndpoint,
        probe: &PeerEndpoint,
    ) -> Result<Reachability, CollaboratorError> {
        let url = format!("{}{}", peer.api_url(self.default_port), self.reachability_path);
        debug!("Asking {} to reach {}", peer, probe);

        let body: serde_json::Value = self
            .client
            .get(&url)
            .query(&self.signed_query(probe))
            .send()
            .await
            .map_err(|e| CollaboratorError::transport("peer", e))?
            .json()
            .await
            .map_err(|e| CollaboratorError::decode("peer", e))?;

        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .ok_or_else(|| CollaboratorError::decode("peer", "missing status"))?;
        let message = body.get("data").map(message_of).unwrap_or_default();

        Ok(Reachability::from_reply(status, &message))
    }

    async fn is_node_reachable(&self, node: &PeerEndpoint) -> bool {
        let url = format!("{}/node/health", node.api_url(self.default_port));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Node {} not reachable: {}", node, e);
                false
            }
        }
    }
}
