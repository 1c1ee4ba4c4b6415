use std::net::IpAddr;

use bgpcp_bgp::{manager::RouterManager, memory::SpeakerCall};
use bgpcp_kubernetes::{
    agent::controller::ControllerState,
    crd::node_config::{CiliumBGPNodeConfig, CONDITION_RECONCILE_ERROR, PEER_STATE_NOT_READY},
    fixture::{
        controller::Harness,
        reconciler::{
            advertisement, bgp_instance, family_adverts, match_labels, neighbor, node, node_config,
            node_peer, peer_config, peering_policy, pod_cidr_advert, secret, virtual_router,
            with_auth,
        },
    },
    mode::ConfigMode,
    store::{StoreEvent, StoreWriter},
};

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn setup() -> Harness {
    let harness = Harness::new();
    harness.sync_all();
    harness.stores.node.apply(StoreEvent::Upsert(node(
        "node1",
        &[("bgp", "enabled")],
        "10.244.1.0/24",
        "192.168.0.11",
    )));
    harness.stores.advertisements.apply(StoreEvent::Upsert(advertisement(
        "pod-cidr",
        &[("adv", "bgp")],
        vec![pod_cidr_advert()],
    )));
    harness
}

fn main_config(peer_config: &str) -> CiliumBGPNodeConfig {
    node_config(
        "node1",
        vec![bgp_instance(
            "main",
            65001,
            vec![node_peer("tor", "10.0.0.1", 65002, Some(peer_config))],
        )],
    )
}

#[tokio::test]
async fn integration_test_bgpv2_missing_auth_secret() {
    let mut harness = setup();
    harness
        .stores
        .peer_configs
        .apply(StoreEvent::Upsert(with_auth(
            peer_config(
                "secured",
                vec![family_adverts("ipv4", Some(match_labels(&[("adv", "bgp")])))],
            ),
            "bgp-auth",
        )));
    harness
        .stores
        .node_configs
        .apply(StoreEvent::Upsert(main_config("secured")));

    dbg!("The peer waits for its secret");
    let report = harness.pass().await;
    assert_eq!(ConfigMode::BGPv2, report.mode);
    let rows = harness.errors.list_instance("main");
    assert_eq!(1, rows.len(), "{rows:?}");
    assert_eq!("PeerConfig", rows[0].resource_kind);
    assert_eq!("secured", rows[0].resource_name);
    assert!(rows[0].error.contains("secret not found"));
    let peered = harness
        .manager
        .router(65001)
        .map(|r| r.neighbors.contains_key(&addr("10.0.0.1")))
        .unwrap_or(false);
    assert!(!peered);

    let status = harness.status.last().unwrap();
    let condition = status
        .conditions
        .iter()
        .find(|c| c.type_ == CONDITION_RECONCILE_ERROR)
        .unwrap();
    assert_eq!("True", condition.status);
    assert!(condition.message.contains("secured"));
    assert_eq!(
        Some(PEER_STATE_NOT_READY.to_string()),
        status.bgp_instances[0].peers[0].peering_state
    );

    dbg!("Repeating the failure counts on the same row");
    harness.pass().await;
    let rows = harness.errors.list_instance("main");
    assert_eq!(1, rows.len());
    assert_eq!(2, rows[0].count);

    dbg!("The secret is created");
    harness
        .stores
        .secrets
        .as_ref()
        .unwrap()
        .apply(StoreEvent::Upsert(secret("bgp-auth", "s3cr3t")));
    harness.pass().await;
    assert!(harness.errors.list_instance("main").is_empty());
    let router = harness.manager.router(65001).unwrap();
    assert_eq!(
        Some("s3cr3t".to_string()),
        router.neighbors[&addr("10.0.0.1")].auth_password
    );
    let status = harness.status.last().unwrap();
    let condition = status
        .conditions
        .iter()
        .find(|c| c.type_ == CONDITION_RECONCILE_ERROR)
        .unwrap();
    assert_eq!("False", condition.status);
    assert_eq!(1, status.bgp_instances.len());
    assert_eq!(1, status.bgp_instances[0].peers.len());
    assert_eq!(
        Some("established".to_string()),
        status.bgp_instances[0].peers[0].peering_state
    );
}

#[tokio::test]
async fn integration_test_bgpv2_status_is_written_once() {
    let mut harness = setup();
    harness.stores.peer_configs.apply(StoreEvent::Upsert(peer_config(
        "plain",
        vec![family_adverts("ipv4", Some(match_labels(&[("adv", "bgp")])))],
    )));
    harness
        .stores
        .node_configs
        .apply(StoreEvent::Upsert(main_config("plain")));

    harness.pass().await;
    assert_eq!(1, harness.status.writes().len());
    let calls = harness.calls();
    assert!(calls.contains(&SpeakerCall::AdvertisePath {
        asn: 65001,
        prefix: "10.244.1.0/24".parse().unwrap()
    }));
    assert!(calls.contains(&SpeakerCall::SetPolicies {
        asn: 65001,
        names: vec!["tor-export".to_string()]
    }));

    harness.pass().await;
    assert!(harness.calls().is_empty());
    assert_eq!(1, harness.status.writes().len());
}

#[tokio::test]
async fn integration_test_switch_from_bgpv1_to_bgpv2() {
    let mut harness = setup();
    harness.stores.peering_policies.apply(StoreEvent::Upsert(peering_policy(
        "legacy",
        None,
        vec![virtual_router(65001, vec![neighbor("10.0.0.9", 65009)])],
    )));
    let report = harness.pass().await;
    assert_eq!(ConfigMode::BGPv1, report.mode);
    harness.calls();

    dbg!("A node config takes over the node");
    harness.stores.peer_configs.apply(StoreEvent::Upsert(peer_config(
        "plain",
        vec![family_adverts("ipv4", Some(match_labels(&[("adv", "bgp")])))],
    )));
    harness
        .stores
        .node_configs
        .apply(StoreEvent::Upsert(main_config("plain")));
    let report = harness.pass().await;
    assert_eq!(ConfigMode::BGPv2, report.mode);
    assert_eq!(ControllerState::Idle, report.state);
    assert_eq!(ConfigMode::BGPv2, harness.mode.get());

    let calls = harness.calls();
    let stop = calls
        .iter()
        .position(|c| *c == SpeakerCall::Stop { asn: 65001 })
        .unwrap();
    let start = calls
        .iter()
        .position(|c| *c == SpeakerCall::Start { asn: 65001 })
        .unwrap();
    assert!(stop < start, "{calls:?}");

    let router = harness.manager.router(65001).unwrap();
    let peers: Vec<IpAddr> = router.neighbors.keys().cloned().collect();
    assert_eq!(vec![addr("10.0.0.1")], peers);
    assert!(harness.errors.list_instance("asn-65001").is_empty());

    let ignored = harness.errors.list_instance("bgp-control-plane");
    assert_eq!(1, ignored.len());
    assert_eq!("PeeringPolicy", ignored[0].resource_kind);
    assert_eq!("legacy", ignored[0].resource_name);
}
