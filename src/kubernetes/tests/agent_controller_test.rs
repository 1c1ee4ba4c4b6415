use std::time::Duration;

use bgpcp_bgp::memory::SpeakerCall;
use bgpcp_kubernetes::{
    agent::{config::Config, controller::ControllerState},
    fixture::{
        controller::Harness,
        reconciler::{neighbor, node, peering_policy, virtual_router},
    },
    store::{StoreEvent, StoreWriter},
};

fn upsert_node(harness: &Harness) {
    harness.stores.node.apply(StoreEvent::Upsert(node(
        "node1",
        &[("bgp", "enabled")],
        "10.244.1.0/24",
        "192.168.0.11",
    )));
}

fn setup() -> Harness {
    let harness = Harness::new();
    harness.sync_all();
    upsert_node(&harness);
    harness
}

#[tokio::test]
async fn integration_test_waits_for_sync() {
    let mut harness = Harness::new();
    upsert_node(&harness);
    let report = harness.pass().await;
    assert_eq!(ControllerState::WaitingForSync, report.state);

    harness.sync_all();
    let report = harness.pass().await;
    assert_eq!(ControllerState::Idle, report.state);
}

#[tokio::test(start_paused = true)]
async fn integration_test_event_storm_runs_one_pass() {
    let harness = setup();
    harness
        .stores
        .peering_policies
        .apply(StoreEvent::Upsert(peering_policy(
            "default",
            None,
            vec![virtual_router(65001, vec![neighbor("10.0.0.1", 65002)])],
        )));
    for _ in 0..1000 {
        harness.signaler.event();
    }

    let Harness {
        controller,
        diagnostics,
        token,
        factory,
        ..
    } = harness;
    let handle = tokio::spawn(controller.run());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(1, diagnostics.read().await.passes);
    assert_eq!(
        1,
        factory
            .log()
            .calls()
            .iter()
            .filter(|c| matches!(c, SpeakerCall::Start { .. }))
            .count()
    );

    dbg!("Shutting down tears the router down");
    token.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(Some(SpeakerCall::Stop { asn: 65001 }), factory.log().calls().last().cloned());
}

#[tokio::test]
async fn integration_test_fatal_start_waits_for_change() {
    let mut harness = setup();
    harness.factory.set_fail_start(true);
    let policy = peering_policy(
        "default",
        None,
        vec![virtual_router(65001, vec![neighbor("10.0.0.1", 65002)])],
    );
    harness
        .stores
        .peering_policies
        .apply(StoreEvent::Upsert(policy.clone()));

    let report = harness.pass().await;
    assert_eq!(ControllerState::Failed, report.state);
    let rows = harness.errors.list_instance("asn-65001");
    assert_eq!(1, rows.len());
    assert_eq!("Preflight", rows[0].stage);

    dbg!("Nothing runs until the configuration changes");
    harness.factory.set_fail_start(false);
    let report = harness.pass().await;
    assert_eq!(ControllerState::Failed, report.state);
    assert!(report.instances.is_empty());
    assert!(harness.calls().is_empty());

    let mut policy = policy;
    policy.metadata.resource_version = Some("2".to_string());
    harness
        .stores
        .peering_policies
        .apply(StoreEvent::Upsert(policy));
    let report = harness.pass().await;
    assert_eq!(ControllerState::Idle, report.state);
    assert_eq!(Some(SpeakerCall::Start { asn: 65001 }), harness.calls().first().cloned());
    assert!(harness.errors.list_instance("asn-65001").is_empty());
}

#[tokio::test]
async fn integration_test_started_pass_completes_after_shutdown_request() {
    let mut harness = setup();
    harness
        .stores
        .peering_policies
        .apply(StoreEvent::Upsert(peering_policy(
            "default",
            None,
            vec![virtual_router(65001, vec![neighbor("10.0.0.1", 65002)])],
        )));
    harness.token.cancel();

    let report = harness.pass().await;
    assert_eq!(ControllerState::Idle, report.state);
    assert!(report.instances["asn-65001"].iter().all(|r| r.ran()));
    assert_eq!(Some(SpeakerCall::Start { asn: 65001 }), harness.calls().first().cloned());
}

#[tokio::test]
async fn integration_test_disabled_controller_does_nothing() {
    let config = Config {
        enabled: false,
        ..Default::default()
    };
    let mut harness = Harness::with_config(config);
    harness.sync_all();
    harness
        .stores
        .peering_policies
        .apply(StoreEvent::Upsert(peering_policy(
            "default",
            None,
            vec![virtual_router(65001, vec![])],
        )));
    let report = harness.pass().await;
    assert_eq!(ControllerState::Disabled, report.state);
    assert_eq!(ControllerState::Disabled, harness.controller.state().get());
    assert!(harness.calls().is_empty());
}
