//! Collision Detector
//!
//! Periodically compares this node's observed address and collateral against
//! the deterministic node list. Two live instances claiming one identity is
//! an unrecoverable conflict: the losing side latches a collision DOS score
//! that only a restart clears. When no collision fires and the network is
//! mature enough, the cycle ends with an availability verification.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::availability::{AvailabilityOutcome, AvailabilityVerifier};
use crate::collaborators::{
    AddressAdjuster, BenchmarkService, ChainSyncStatus, CollaboratorError, LedgerConfirmation,
    NodeListProvider, PeerReachability,
};
use crate::config::CollisionConfig;
use crate::health::HealthContext;
use crate::node_list::{collateral_elsewhere, entries_at, NodeListEntry, PeerEndpoint};

/// Penalty when our own address cannot be determined
pub const ADDRESS_UNAVAILABLE_PENALTY: f64 = 1.0;

// =============================================================================
// DECISION TABLE
// =============================================================================

/// Result of comparing the node list against our identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionVerdict {
    /// No identity conflict
    Clear,
    /// Another identity owns our address, or we lost a duplicate race
    Collision(String),
    /// Our collateral is confirmed at a different address
    CollateralElsewhere(PeerEndpoint),
}

/// Pure decision table over a node list snapshot.
///
/// With several entries at our address we keep running only when our own
/// entry has the lowest confirmation height; a tie counts as lowest. An
/// empty `collateral` means the node has no registered identity and
/// nothing can collide with it.
pub fn evaluate(
    list: &[NodeListEntry],
    me: &PeerEndpoint,
    collateral: &str,
    default_port: u16,
) -> CollisionVerdict {
    if collateral.is_empty() {
        return CollisionVerdict::Clear;
    }

    let at_my_address = entries_at(list, me, default_port);

    if at_my_address.len() > 1 {
        let Some(mine) = at_my_address.iter().find(|e| e.collateral == collateral) else {
            return CollisionVerdict::Collision(format!(
                "{} nodes registered at {}, none with our collateral",
                at_my_address.len(),
                me
            ));
        };

        let earlier = at_my_address
            .iter()
            .filter(|e| e.collateral != collateral)
            .any(|e| e.confirmed_height < mine.confirmed_height);
        if earlier {
            return CollisionVerdict::Collision(format!(
                "Multiple instances at {}; another node was confirmed before height {}",
                me, mine.confirmed_height
            ));
        }
        return CollisionVerdict::Clear;
    }

    if let Some(entry) = at_my_address.first() {
        if entry.collateral != collateral {
            return CollisionVerdict::Collision(format!(
                "Address {} is registered to foreign collateral {}",
                me, entry.collateral
            ));
        }
        return CollisionVerdict::Clear;
    }

    match collateral_elsewhere(list, collateral, me, default_port).and_then(|e| e.endpoint()) {
        Some(other) => CollisionVerdict::CollateralElsewhere(other),
        None => CollisionVerdict::Clear,
    }
}

// =============================================================================
// DETECTOR
// =============================================================================

/// What one detector cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A collision is latched; nothing runs until restart
    Halted,
    AddressUnavailable,
    NotSynced,
    Collision(String),
    /// Our collateral lives elsewhere but that node is gone; ownership reasserted
    IdentityClaimed { txid: Option<String> },
    /// Network too young and uptime too short for availability checks
    Immature,
    Verified(AvailabilityOutcome),
}

pub struct CollisionDetector {
    ctx: Arc<HealthContext>,
    config: CollisionConfig,
    collateral: String,
    default_port: u16,
    benchmark: Arc<dyn BenchmarkService>,
    node_list: Arc<dyn NodeListProvider>,
    sync: Arc<dyn ChainSyncStatus>,
    peers: Arc<dyn PeerReachability>,
    ledger: Arc<dyn LedgerConfirmation>,
    adjuster: Arc<dyn AddressAdjuster>,
    verifier: AvailabilityVerifier,
}

impl CollisionDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<HealthContext>,
        config: CollisionConfig,
        collateral: &str,
        default_port: u16,
        benchmark: Arc<dyn BenchmarkService>,
        node_list: Arc<dyn NodeListProvider>,
        sync: Arc<dyn ChainSyncStatus>,
        peers: Arc<dyn PeerReachability>,
        ledger: Arc<dyn LedgerConfirmation>,
        adjuster: Arc<dyn AddressAdjuster>,
        verifier: AvailabilityVerifier,
    ) -> Self {
        Self {
            ctx,
            config,
            collateral: collateral.to_string(),
            default_port,
            benchmark,
            node_list,
            sync,
            peers,
            ledger,
            adjuster,
            verifier,
        }
    }

    /// Run one detection cycle
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CollaboratorError> {
        if self.ctx.dos.is_collision() {
            return Ok(CycleOutcome::Halted);
        }

        let me = match self.observed_endpoint().await {
            Some(endpoint) => endpoint,
            None => return Ok(CycleOutcome::AddressUnavailable),
        };

        if !self.sync.is_synced().await? {
            debug!("Chain not synced yet, postponing collision check");
            return Ok(CycleOutcome::NotSynced);
        }

        let list = self.node_list.node_list().await?;

        match evaluate(&list, &me, &self.collateral, self.default_port) {
            CollisionVerdict::Collision(reason) => {
                self.ctx.dos.mark_collision(&reason);
                return Ok(CycleOutcome::Collision(reason));
            }
            CollisionVerdict::CollateralElsewhere(other) => {
                return Ok(self.resolve_collateral_elsewhere(&me, other).await);
            }
            CollisionVerdict::Clear => {}
        }

        if let Some(rotation) = self.verifier.adopt_observed_address(&me).await {
            if !rotation.is_available() {
                return Ok(CycleOutcome::Verified(rotation));
            }
        }

        let mature = list.len() > self.config.maturity_node_count;
        let settled =
            self.ctx.uptime() > Duration::from_secs(self.config.pre_maturity_uptime_secs);
        if !mature && !settled {
            debug!(
                "Network has {} nodes and uptime is {:?}, skipping availability check",
                list.len(),
                self.ctx.uptime()
            );
            return Ok(CycleOutcome::Immature);
        }

        let outcome = self.verifier.verify().await;
        if let AvailabilityOutcome::Available { .. } = outcome {
            let confirmed = self.ctx.local_endpoint().unwrap_or(me);
            if let Err(e) = self.adjuster.adjust_external_ip(&confirmed).await {
                warn!("Failed to propagate confirmed address {}: {}", confirmed, e);
            }
        }
        Ok(CycleOutcome::Verified(outcome))
    }

    async fn observed_endpoint(&self) -> Option<PeerEndpoint> {
        let raw = match self.benchmark.get_public_ip().await {
            Ok(raw) => raw,
            Err(e) => {
                self.ctx.dos.add_penalty(
                    ADDRESS_UNAVAILABLE_PENALTY,
                    &format!("Unable to determine node address: {}", e),
                );
                return None;
            }
        };

        match PeerEndpoint::parse(&raw) {
            Some(endpoint) => Some(endpoint),
            None => {
                self.ctx.dos.add_penalty(
                    ADDRESS_UNAVAILABLE_PENALTY,
                    &format!("Benchmark reported unparseable address '{}'", raw),
                );
                None
            }
        }
    }

    async fn resolve_collateral_elsewhere(
        &self,
        me: &PeerEndpoint,
        other: PeerEndpoint,
    ) -> CycleOutcome {
        if self.peers.is_node_reachable(&other).await {
            let reason = format!(
                "Collateral {} is confirmed and running at {}, {} must yield",
                self.collateral, other, me
            );
            self.ctx.dos.mark_collision(&reason);
            return CycleOutcome::Collision(reason);
        }

        info!(
            "Collateral {} confirmed at unreachable {}, reasserting ownership from {}",
            self.collateral, other, me
        );
        match self.ledger.create_confirmation_transaction().await {
            Ok(txid) => {
                info!("Confirmation transaction {} created", txid);
                CycleOutcome::IdentityClaimed { txid: Some(txid) }
            }
            Err(e) => {
                warn!("Confirmation transaction failed: {}", e);
                CycleOutcome::IdentityClaimed { txid: None }
            }
        }
    }

    fn delay_after(&self, outcome: &CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::NotSynced => Duration::from_secs(self.config.sync_wait_secs),
            _ => Duration::from_secs(self.config.interval_secs),
        }
    }

    /// Perpetual detection loop. Every error is logged and rescheduled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Collision detector started (interval: {}s)",
            self.config.interval_secs
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(outcome) => {
                    debug!("Collision cycle finished: {:?}", outcome);
                    self.delay_after(&outcome)
                }
                Err(e) => {
                    error!("Collision cycle failed: {}", e);
                    Duration::from_secs(self.config.error_interval_secs)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Collision detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: u16 = 16127;

    fn entry(ip: &str, collateral: &str, height: u64) -> NodeListEntry {
        NodeListEntry {
            ip: ip.to_string(),
            collateral: collateral.to_string(),
            confirmed_height: height,
            status: "CONFIRMED".to_string(),
            pubkey: String::new(),
        }
    }

    fn me() -> PeerEndpoint {
        PeerEndpoint::new("1.2.3.4", None)
    }

    #[test]
    fn test_duplicate_where_we_are_earliest_is_clear() {
        let list = vec![entry("1.2.3.4", "mine:0", 100), entry("1.2.3.4", "other:0", 200)];
        assert_eq!(evaluate(&list, &me(), "mine:0", PORT), CollisionVerdict::Clear);
    }

    #[test]
    fn test_duplicate_where_we_are_later_collides() {
        let list = vec![entry("1.2.3.4", "mine:0", 300), entry("1.2.3.4", "other:0", 200)];
        assert!(matches!(
            evaluate(&list, &me(), "mine:0", PORT),
            CollisionVerdict::Collision(_)
        ));
    }

    #[test]
    fn test_duplicate_tie_counts_as_earliest() {
        let list = vec![entry("1.2.3.4", "mine:0", 200), entry("1.2.3.4:16127", "other:0", 200)];
        assert_eq!(evaluate(&list, &me(), "mine:0", PORT), CollisionVerdict::Clear);
    }

    #[test]
    fn test_duplicate_without_our_entry_collides() {
        let list = vec![entry("1.2.3.4", "a:0", 1), entry("1.2.3.4", "b:0", 2)];
        assert!(matches!(
            evaluate(&list, &me(), "mine:0", PORT),
            CollisionVerdict::Collision(_)
        ));
    }

    #[test]
    fn test_single_foreign_entry_collides() {
        let list = vec![entry("1.2.3.4", "foreign:1", 10), entry("5.6.7.8", "mine:0", 5)];
        assert!(matches!(
            evaluate(&list, &me(), "mine:0", PORT),
            CollisionVerdict::Collision(_)
        ));
    }

    #[test]
    fn test_different_port_is_a_different_node() {
        let list = vec![entry("1.2.3.4:16137", "foreign:1", 10), entry("1.2.3.4", "mine:0", 5)];
        assert_eq!(evaluate(&list, &me(), "mine:0", PORT), CollisionVerdict::Clear);
    }

    #[test]
    fn test_collateral_elsewhere() {
        let list = vec![entry("5.6.7.8:16137", "mine:0", 5)];
        assert_eq!(
            evaluate(&list, &me(), "mine:0", PORT),
            CollisionVerdict::CollateralElsewhere(PeerEndpoint::new("5.6.7.8", Some(16137)))
        );
    }

    #[test]
    fn test_unregistered_node_never_collides() {
        let list = vec![entry("1.2.3.4", "foreign:1", 10)];
        assert_eq!(evaluate(&list, &me(), "", PORT), CollisionVerdict::Clear);
        assert_eq!(evaluate(&[], &me(), "mine:0", PORT), CollisionVerdict::Clear);
    }
}
