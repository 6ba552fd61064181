//! Collision detector cycles driven by in-memory collaborators

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use meshguard_node::availability::{AvailabilityOutcome, RejectReason};
use meshguard_node::collaborators::{CollaboratorError, Reachability};
use meshguard_node::collision::{CollisionDetector, CycleOutcome};
use meshguard_node::config::CollisionConfig;
use meshguard_node::dos_state::COLLISION_SCORE;
use meshguard_node::node_list::PeerEndpoint;

struct Detector {
    harness: Harness,
    ledger: Arc<FakeLedger>,
    detector: CollisionDetector,
}

fn collision_config() -> CollisionConfig {
    CollisionConfig {
        interval_secs: 60,
        error_interval_secs: 120,
        sync_wait_secs: 240,
        maturity_node_count: 2,
        pre_maturity_uptime_secs: 3600,
    }
}

fn detector_with(harness: Harness, config: CollisionConfig, synced: bool) -> Detector {
    let ledger = Arc::new(FakeLedger::default());
    let detector = CollisionDetector::new(
        harness.ctx.clone(),
        config,
        MY_COLLATERAL,
        PORT,
        harness.benchmark.clone(),
        harness.node_list.clone(),
        Arc::new(FakeSync(synced)),
        harness.peers.clone(),
        ledger.clone(),
        harness.adjuster.clone(),
        harness.verifier(),
    );
    Detector {
        harness,
        ledger,
        detector,
    }
}

fn detector(harness: Harness) -> Detector {
    detector_with(harness, collision_config(), true)
}

fn set_list(harness: &Harness, list: Vec<meshguard_node::node_list::NodeListEntry>) {
    *harness.node_list.list.lock().unwrap() = Ok(list);
}

#[tokio::test]
async fn test_clean_cycle_runs_availability_and_propagates_address() {
    let d = detector(Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])));

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Verified(AvailabilityOutcome::Available { full: true })
    );
    assert_eq!(
        *d.harness.adjuster.adjusted.lock().unwrap(),
        vec![PeerEndpoint::new(MY_IP, None)]
    );
}

#[tokio::test]
async fn test_observed_address_change_refreshes_verifier_target() {
    let d = detector(Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])));
    d.harness
        .ctx
        .set_local_endpoint(PeerEndpoint::new("1.1.1.1", None));

    let outcome = d.detector.run_cycle().await.unwrap();

    // Only the new address is listed, so a full pass means it was verified
    assert_eq!(
        outcome,
        CycleOutcome::Verified(AvailabilityOutcome::Available { full: true })
    );
    assert_eq!(d.harness.peers.calls(), 1);
    assert_eq!(
        d.harness.ctx.local_endpoint(),
        Some(PeerEndpoint::new(MY_IP, None))
    );
    assert!(!d.harness.ctx.ip_guard.is_over_limit());
}

#[tokio::test]
async fn test_observed_address_change_counts_against_ip_guard() {
    let d = detector(Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])));
    d.harness
        .ctx
        .set_local_endpoint(PeerEndpoint::new("1.1.1.1", None));
    d.harness.ctx.ip_guard.changes_over_limit();

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Verified(AvailabilityOutcome::Rejected(
            RejectReason::TooManyIpChanges
        ))
    );
    assert!(d.harness.ctx.ip_guard.is_over_limit());
    assert_eq!(d.harness.peers.calls(), 0);
    assert!(!d.harness.workloads.removed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_where_we_are_earliest_keeps_running() {
    let d = detector(Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])));
    let mut list = healthy_list();
    list.push(entry(MY_IP, "intruder:0", 500));
    set_list(&d.harness, list);

    let outcome = d.detector.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Verified(_)));
    assert!(d.harness.ctx.dos.score() < COLLISION_SCORE);
    assert!(!d.harness.ctx.dos.is_collision());
}

#[tokio::test]
async fn test_duplicate_where_we_are_later_collides() {
    let d = detector(Harness::new(FakePeers::new(vec![])));
    let mut list = healthy_list();
    list.push(entry(MY_IP, "incumbent:0", 50));
    set_list(&d.harness, list);

    let outcome = d.detector.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Collision(_)));
    assert_eq!(d.harness.ctx.dos.score(), COLLISION_SCORE);
    assert!(d.harness.ctx.dos.is_collision());
    assert_eq!(d.harness.peers.calls(), 0);

    // Latched until restart
    assert!(!d.harness.ctx.dos.reset());
    assert_eq!(d.detector.run_cycle().await.unwrap(), CycleOutcome::Halted);
}

#[tokio::test]
async fn test_foreign_identity_at_our_address_collides() {
    let d = detector(Harness::new(FakePeers::new(vec![])));
    set_list(
        &d.harness,
        vec![entry(MY_IP, "foreign:3", 10), entry("10.0.0.2", "b:0", 11)],
    );

    let outcome = d.detector.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Collision(_)));
    assert_eq!(d.harness.ctx.dos.score(), COLLISION_SCORE);
}

#[tokio::test]
async fn test_live_instance_elsewhere_forces_yield() {
    let other = PeerEndpoint::new("9.9.9.9", None);
    let d = detector(Harness::new(FakePeers::with_alive(vec![], vec![other])));
    set_list(
        &d.harness,
        vec![entry("9.9.9.9", MY_COLLATERAL, 10), entry("10.0.0.2", "b:0", 11)],
    );

    let outcome = d.detector.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Collision(_)));
    assert!(d.harness.ctx.dos.is_collision());
    assert_eq!(d.ledger.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dead_instance_elsewhere_is_claimed() {
    let d = detector(Harness::new(FakePeers::new(vec![])));
    set_list(
        &d.harness,
        vec![entry("9.9.9.9", MY_COLLATERAL, 10), entry("10.0.0.2", "b:0", 11)],
    );

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::IdentityClaimed {
            txid: Some("txid-1".to_string())
        }
    );
    assert_eq!(d.ledger.calls.load(Ordering::SeqCst), 1);
    assert!(!d.harness.ctx.dos.is_collision());
    assert_eq!(d.harness.ctx.dos.score(), 0.0);
}

#[tokio::test]
async fn test_missing_address_costs_one_point() {
    let mut harness = Harness::new(FakePeers::new(vec![]));
    harness.benchmark = FakeBenchmark::new(
        "4.2.0",
        vec![Err(CollaboratorError::transport("benchmark", "down"))],
    );
    let d = detector(harness);

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(outcome, CycleOutcome::AddressUnavailable);
    assert_eq!(d.harness.ctx.dos.score(), 1.0);
}

#[tokio::test]
async fn test_waits_for_chain_sync() {
    let d = detector_with(
        Harness::new(FakePeers::new(vec![])),
        collision_config(),
        false,
    );

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(outcome, CycleOutcome::NotSynced);
    assert_eq!(d.harness.peers.calls(), 0);
}

#[tokio::test]
async fn test_immature_network_skips_availability() {
    let mut config = collision_config();
    config.maturity_node_count = 50;
    let d = detector_with(Harness::new(FakePeers::new(vec![])), config, true);

    let outcome = d.detector.run_cycle().await.unwrap();

    assert_eq!(outcome, CycleOutcome::Immature);
    assert_eq!(d.harness.peers.calls(), 0);
}

#[tokio::test]
async fn test_settled_uptime_checks_immature_network() {
    let mut config = collision_config();
    config.maturity_node_count = 50;
    config.pre_maturity_uptime_secs = 0;
    let d = detector_with(
        Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])),
        config,
        true,
    );

    // Uptime is compared strictly; give the clock a moment to move
    tokio::time::sleep(Duration::from_millis(5)).await;
    let outcome = d.detector.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Verified(_)));
}

#[tokio::test]
async fn test_node_list_failure_is_an_error() {
    let mut harness = Harness::new(FakePeers::new(vec![]));
    harness.node_list = FakeNodeList::failing();
    let d = detector(harness);

    assert!(d.detector.run_cycle().await.is_err());
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let d = detector(Harness::new(FakePeers::new(vec![Ok(Reachability::Reachable)])));
    let detector = Arc::new(d.detector);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(detector.run(rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("detector loop did not stop")
        .unwrap();
}
