// #[cfg(test)]
pub mod reconciler {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex, PoisonError},
    };

    use async_trait::async_trait;
    use k8s_openapi::{
        api::core::v1::{
            EndpointAddress, EndpointSubset, Endpoints, LoadBalancerIngress, LoadBalancerStatus,
            Node, NodeAddress, NodeSpec, NodeStatus, Secret, Service, ServiceSpec, ServiceStatus,
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
        ByteString,
    };
    use kube::core::ObjectMeta;

    use crate::{
        crd::{
            advertisement::{
                AdvertisementType, BGPAdvertisement, BGPAttributes, BGPCommunities,
                BGPServiceOptions, CiliumBGPAdvertisement, CiliumBGPAdvertisementSpec,
                ServiceAddressType,
            },
            lb_ip_pool::{
                CiliumLoadBalancerIPPool, CiliumLoadBalancerIPPoolIPBlock,
                CiliumLoadBalancerIPPoolSpec,
            },
            node_config::{
                CiliumBGPNodeConfig, CiliumBGPNodeConfigSpec, CiliumBGPNodeConfigStatus,
                CiliumBGPNodeInstance, CiliumBGPNodePeer, PeerConfigReference,
            },
            peer_config::{CiliumBGPFamilyWithAdverts, CiliumBGPPeerConfig, CiliumBGPPeerConfigSpec},
            peering_policy::{
                CiliumBGPNeighbor, CiliumBGPPeeringPolicy, CiliumBGPPeeringPolicySpec,
                CiliumBGPVirtualRouter,
            },
            pod_ip_pool::{CiliumPodIPPool, CiliumPodIPPoolSpec, IPv4PoolSpec},
        },
        error::Error,
        reconciler::v2::state::NodeConfigStatusWriter,
    };

    pub const TEST_SECRETS_NAMESPACE: &str = "kube-system";

    fn meta(namespace: Option<&str>, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|ns| ns.to_string()),
            labels: (!labels.is_empty()).then(|| {
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        }
    }

    pub fn match_labels(labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    /// Local node. Empty `pod_cidr` or `internal_ip` leave the field unset.
    pub fn node(name: &str, labels: &[(&str, &str)], pod_cidr: &str, internal_ip: &str) -> Node {
        Node {
            metadata: meta(None, name, labels),
            spec: Some(NodeSpec {
                pod_cidr: (!pod_cidr.is_empty()).then(|| pod_cidr.to_string()),
                pod_cidrs: (!pod_cidr.is_empty()).then(|| vec![pod_cidr.to_string()]),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: (!internal_ip.is_empty()).then(|| {
                    vec![NodeAddress {
                        address: internal_ip.to_string(),
                        type_: "InternalIP".to_string(),
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    pub fn secret(name: &str, password: &str) -> Secret {
        Secret {
            metadata: meta(Some(TEST_SECRETS_NAMESPACE), name, &[]),
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(password.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct ServiceParams {
        pub namespace: String,
        pub name: String,
        pub labels: Vec<(String, String)>,
        pub type_: String,
        pub load_balancer_class: Option<String>,
        pub external_traffic_policy: Option<String>,
        pub internal_traffic_policy: Option<String>,
        pub cluster_ips: Vec<String>,
        pub external_ips: Vec<String>,
        pub load_balancer_ips: Vec<String>,
    }

    impl ServiceParams {
        pub fn load_balancer(namespace: &str, name: &str, ip: &str) -> Self {
            ServiceParams {
                namespace: namespace.to_string(),
                name: name.to_string(),
                type_: "LoadBalancer".to_string(),
                external_traffic_policy: Some("Cluster".to_string()),
                cluster_ips: vec!["10.96.0.100".to_string()],
                load_balancer_ips: vec![ip.to_string()],
                ..Default::default()
            }
        }

        pub fn labels(mut self, labels: &[(&str, &str)]) -> Self {
            self.labels = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self
        }
    }

    pub fn service(params: ServiceParams) -> Service {
        let labels: Vec<(&str, &str)> = params
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        Service {
            metadata: meta(Some(&params.namespace), &params.name, &labels),
            spec: Some(ServiceSpec {
                type_: Some(params.type_.clone()),
                load_balancer_class: params.load_balancer_class.clone(),
                external_traffic_policy: params.external_traffic_policy.clone(),
                internal_traffic_policy: params.internal_traffic_policy.clone(),
                cluster_ip: params.cluster_ips.first().cloned(),
                cluster_ips: (!params.cluster_ips.is_empty()).then(|| params.cluster_ips.clone()),
                external_ips: (!params.external_ips.is_empty())
                    .then(|| params.external_ips.clone()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                conditions: None,
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(
                        params
                            .load_balancer_ips
                            .iter()
                            .map(|ip| LoadBalancerIngress {
                                ip: Some(ip.clone()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                }),
            }),
        }
    }

    /// Endpoints with one ready address per `(ip, node)` pair.
    pub fn endpoints(namespace: &str, name: &str, addresses: &[(&str, &str)]) -> Endpoints {
        Endpoints {
            metadata: meta(Some(namespace), name, &[]),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(ip, node)| EndpointAddress {
                            ip: ip.to_string(),
                            node_name: Some(node.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    pub fn neighbor(address: &str, peer_asn: i64) -> CiliumBGPNeighbor {
        CiliumBGPNeighbor {
            peer_address: address.to_string(),
            peer_asn,
            ..Default::default()
        }
    }

    pub fn virtual_router(local_asn: i64, neighbors: Vec<CiliumBGPNeighbor>) -> CiliumBGPVirtualRouter {
        CiliumBGPVirtualRouter {
            local_asn,
            export_pod_cidr: Some(true),
            neighbors,
            ..Default::default()
        }
    }

    pub fn peering_policy(
        name: &str,
        node_selector: Option<LabelSelector>,
        virtual_routers: Vec<CiliumBGPVirtualRouter>,
    ) -> CiliumBGPPeeringPolicy {
        let mut policy = CiliumBGPPeeringPolicy::new(
            name,
            CiliumBGPPeeringPolicySpec {
                node_selector,
                virtual_routers,
            },
        );
        policy.metadata.resource_version = Some("1".to_string());
        policy
    }

    pub fn node_peer(name: &str, address: &str, peer_asn: i64, peer_config: Option<&str>) -> CiliumBGPNodePeer {
        CiliumBGPNodePeer {
            name: name.to_string(),
            peer_address: Some(address.to_string()),
            peer_asn: Some(peer_asn),
            peer_config_ref: peer_config.map(|n| PeerConfigReference {
                name: n.to_string(),
            }),
        }
    }

    pub fn bgp_instance(name: &str, local_asn: i64, peers: Vec<CiliumBGPNodePeer>) -> CiliumBGPNodeInstance {
        CiliumBGPNodeInstance {
            name: name.to_string(),
            local_asn: Some(local_asn),
            router_id: None,
            local_port: None,
            peers: Some(peers),
        }
    }

    pub fn node_config(node_name: &str, instances: Vec<CiliumBGPNodeInstance>) -> CiliumBGPNodeConfig {
        let mut config = CiliumBGPNodeConfig::new(
            node_name,
            CiliumBGPNodeConfigSpec {
                bgp_instances: instances,
            },
        );
        config.metadata.generation = Some(1);
        config
    }

    pub fn family_adverts(afi: &str, selector: Option<LabelSelector>) -> CiliumBGPFamilyWithAdverts {
        CiliumBGPFamilyWithAdverts {
            afi: afi.to_string(),
            safi: "unicast".to_string(),
            advertisements: selector,
        }
    }

    pub fn peer_config(name: &str, families: Vec<CiliumBGPFamilyWithAdverts>) -> CiliumBGPPeerConfig {
        CiliumBGPPeerConfig::new(
            name,
            CiliumBGPPeerConfigSpec {
                families: Some(families),
                ..Default::default()
            },
        )
    }

    pub fn with_auth(mut config: CiliumBGPPeerConfig, secret_ref: &str) -> CiliumBGPPeerConfig {
        config.spec.auth_secret_ref = Some(secret_ref.to_string());
        config
    }

    pub fn pod_cidr_advert() -> BGPAdvertisement {
        BGPAdvertisement {
            advertisement_type: AdvertisementType::PodCIDR,
            ..Default::default()
        }
    }

    pub fn service_advert(addresses: Vec<ServiceAddressType>, selector: Option<LabelSelector>) -> BGPAdvertisement {
        BGPAdvertisement {
            advertisement_type: AdvertisementType::Service,
            service: Some(BGPServiceOptions { addresses }),
            selector,
            attributes: None,
        }
    }

    pub fn with_communities(mut advert: BGPAdvertisement, standard: &[&str]) -> BGPAdvertisement {
        advert.attributes = Some(BGPAttributes {
            communities: Some(BGPCommunities {
                standard: Some(standard.iter().map(|s| s.to_string()).collect()),
                well_known: None,
                large: None,
            }),
            local_preference: None,
        });
        advert
    }

    pub fn advertisement(
        name: &str,
        labels: &[(&str, &str)],
        advertisements: Vec<BGPAdvertisement>,
    ) -> CiliumBGPAdvertisement {
        let mut advert = CiliumBGPAdvertisement::new(name, CiliumBGPAdvertisementSpec { advertisements });
        advert.metadata = meta(None, name, labels);
        advert
    }

    pub fn lb_pool(name: &str, labels: &[(&str, &str)], cidrs: &[&str]) -> CiliumLoadBalancerIPPool {
        let mut pool = CiliumLoadBalancerIPPool::new(
            name,
            CiliumLoadBalancerIPPoolSpec {
                blocks: cidrs
                    .iter()
                    .map(|c| CiliumLoadBalancerIPPoolIPBlock {
                        cidr: c.to_string(),
                    })
                    .collect(),
                disabled: false,
                service_selector: None,
            },
        );
        pool.metadata = meta(None, name, labels);
        pool
    }

    pub fn pod_pool(name: &str, labels: &[(&str, &str)], cidrs: &[&str]) -> CiliumPodIPPool {
        let mut pool = CiliumPodIPPool::new(
            name,
            CiliumPodIPPoolSpec {
                ipv4: Some(IPv4PoolSpec {
                    cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
                    mask_size: 27,
                }),
                ipv6: None,
                disabled: false,
            },
        );
        pool.metadata = meta(None, name, labels);
        pool
    }

    /// Status writer keeping every write in memory.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingStatusWriter {
        writes: Arc<Mutex<Vec<(String, CiliumBGPNodeConfigStatus)>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RecordingStatusWriter {
        pub fn writes(&self) -> Vec<(String, CiliumBGPNodeConfigStatus)> {
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn last(&self) -> Option<CiliumBGPNodeConfigStatus> {
            self.writes().pop().map(|(_, s)| s)
        }

        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = fail;
        }
    }

    #[async_trait]
    impl NodeConfigStatusWriter for RecordingStatusWriter {
        async fn write(&self, name: &str, status: &CiliumBGPNodeConfigStatus) -> Result<(), Error> {
            if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
                return Err(Error::StatusWrite("injected failure".to_string()));
            }
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name.to_string(), status.clone()));
            Ok(())
        }
    }
}

pub mod controller {
    use std::sync::Arc;

    use bgpcp_bgp::{
        manager::BgpRouterManager,
        memory::{MemorySpeakerFactory, SpeakerCall},
    };
    use bgpcp_trace::metrics::Metrics;
    use tokio_util::sync::CancellationToken;

    use super::reconciler::{RecordingStatusWriter, TEST_SECRETS_NAMESPACE};
    use crate::{
        agent::{
            config::Config,
            controller::{Components, Controller, PassReport},
        },
        context::Diagnostics,
        mode::Mode,
        reconciler::snapshot::Stores,
        signaler::Signaler,
        store::{StoreEvent, StoreWriter},
        tables::ReconcileErrorTable,
    };

    pub const TEST_NODE: &str = "node1";

    /// A controller wired to in-memory stores and speaker.
    pub struct Harness {
        pub stores: Stores,
        pub signaler: Signaler,
        pub factory: MemorySpeakerFactory,
        pub manager: Arc<BgpRouterManager>,
        pub errors: Arc<ReconcileErrorTable>,
        pub status: RecordingStatusWriter,
        pub mode: Mode,
        pub diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
        pub token: CancellationToken,
        pub controller: Controller,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(Config::default())
        }

        pub fn with_config(config: Config) -> Self {
            let signaler = Signaler::new();
            let stores = Stores::new(&signaler, Some(TEST_SECRETS_NAMESPACE), true);
            let factory = MemorySpeakerFactory::new().with_auto_establish(true);
            let manager = Arc::new(BgpRouterManager::new(Arc::new(factory.clone())));
            let errors = Arc::new(ReconcileErrorTable::new(config.error_table_capacity));
            let status = RecordingStatusWriter::default();
            let mode = Mode::default();
            let diagnostics = Arc::new(tokio::sync::RwLock::new(Diagnostics::default()));
            let token = CancellationToken::new();
            let controller = Controller::new(
                &config,
                TEST_NODE,
                Components {
                    stores: stores.clone(),
                    signaler: signaler.clone(),
                    mode: mode.clone(),
                    manager: manager.clone(),
                    errors: errors.clone(),
                    status_writer: Arc::new(status.clone()),
                    metrics: Metrics::default(),
                    diagnostics: diagnostics.clone(),
                },
                token.clone(),
            );
            Harness {
                stores,
                signaler,
                factory,
                manager,
                errors,
                status,
                mode,
                diagnostics,
                token,
                controller,
            }
        }

        /// Mark every store as listed.
        pub fn sync_all(&self) {
            let s = &self.stores;
            s.node.apply(StoreEvent::Restarted(vec![]));
            s.peering_policies.apply(StoreEvent::Restarted(vec![]));
            s.node_configs.apply(StoreEvent::Restarted(vec![]));
            s.peer_configs.apply(StoreEvent::Restarted(vec![]));
            s.advertisements.apply(StoreEvent::Restarted(vec![]));
            s.lb_pools.apply(StoreEvent::Restarted(vec![]));
            if let Some(pools) = &s.pod_pools {
                pools.apply(StoreEvent::Restarted(vec![]));
            }
            s.services.apply(StoreEvent::Restarted(vec![]));
            s.endpoints.apply(StoreEvent::Restarted(vec![]));
            if let Some(secrets) = &s.secrets {
                secrets.apply(StoreEvent::Restarted(vec![]));
            }
        }

        pub async fn pass(&mut self) -> PassReport {
            self.controller.reconcile_once().await
        }

        /// Speaker calls issued since the last call to this function.
        pub fn calls(&self) -> Vec<SpeakerCall> {
            self.factory.log().take()
        }
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }
}
