use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Endpoints, Node, Secret, Service};
use kube::ResourceExt;

use crate::{
    crd::{
        advertisement::CiliumBGPAdvertisement, lb_ip_pool::CiliumLoadBalancerIPPool,
        node_config::CiliumBGPNodeConfig, peer_config::CiliumBGPPeerConfig,
        peering_policy::CiliumBGPPeeringPolicy, pod_ip_pool::CiliumPodIPPool,
    },
    signaler::Signaler,
    store::{diff::Diff, DiffStore, ObjectKey, ResourceStore},
};

pub const SECRET_PASSWORD_KEY: &str = "password";

/// Every store the control plane reads from.
#[derive(Debug, Clone)]
pub struct Stores {
    pub node: ResourceStore<Node>,
    pub peering_policies: ResourceStore<CiliumBGPPeeringPolicy>,
    pub node_configs: ResourceStore<CiliumBGPNodeConfig>,
    pub peer_configs: ResourceStore<CiliumBGPPeerConfig>,
    pub advertisements: ResourceStore<CiliumBGPAdvertisement>,
    pub lb_pools: ResourceStore<CiliumLoadBalancerIPPool>,
    pub pod_pools: Option<ResourceStore<CiliumPodIPPool>>,
    pub services: DiffStore<Service>,
    pub endpoints: DiffStore<Endpoints>,
    pub secrets: Option<ResourceStore<Secret>>,
    secrets_namespace: Option<String>,
}

impl Stores {
    pub fn new(signaler: &Signaler, secrets_namespace: Option<&str>, pod_pools: bool) -> Self {
        Stores {
            node: ResourceStore::new(signaler.clone()),
            peering_policies: ResourceStore::new(signaler.clone()),
            node_configs: ResourceStore::new(signaler.clone()),
            peer_configs: ResourceStore::new(signaler.clone()),
            advertisements: ResourceStore::new(signaler.clone()),
            lb_pools: ResourceStore::new(signaler.clone()),
            pod_pools: pod_pools.then(|| ResourceStore::new(signaler.clone())),
            services: DiffStore::new(signaler.clone()),
            endpoints: DiffStore::new(signaler.clone()),
            secrets: secrets_namespace.map(|_| ResourceStore::new(signaler.clone())),
            secrets_namespace: secrets_namespace.map(|ns| ns.to_string()),
        }
    }

    pub fn synced(&self) -> bool {
        self.node.synced()
            && self.peering_policies.synced()
            && self.node_configs.synced()
            && self.peer_configs.synced()
            && self.advertisements.synced()
            && self.lb_pools.synced()
            && self.pod_pools.as_ref().map(|s| s.synced()).unwrap_or(true)
            && self.services.synced()
            && self.endpoints.synced()
            && self.secrets.as_ref().map(|s| s.synced()).unwrap_or(true)
    }

    /// Sum of store generations, changes whenever any store changes.
    pub fn generation(&self) -> u64 {
        self.node.generation()
            + self.peering_policies.generation()
            + self.node_configs.generation()
            + self.peer_configs.generation()
            + self.advertisements.generation()
            + self.lb_pools.generation()
            + self.pod_pools.as_ref().map(|s| s.generation()).unwrap_or(0)
            + self.services.store().generation()
            + self.endpoints.store().generation()
            + self.secrets.as_ref().map(|s| s.generation()).unwrap_or(0)
    }

    /// Read every store once and drain the pending diffs.
    pub fn snapshot(&self, node_name: &str) -> Snapshot {
        self.snapshot_after_drain(node_name, || {})
    }

    /// Diffs are drained before the objects are read, so a change landing in
    /// between is seen now and stays pending for the next pass.
    fn snapshot_after_drain(&self, node_name: &str, drained: impl FnOnce()) -> Snapshot {
        let service_diff = self.services.diff();
        let endpoints_diff = self.endpoints.diff();
        drained();
        Snapshot {
            node_name: node_name.to_string(),
            node: self.node.get(None, node_name),
            peering_policies: self.peering_policies.list(),
            node_config: self.node_configs.get(None, node_name),
            peer_configs: by_name(self.peer_configs.list()),
            advertisements: self.advertisements.list(),
            lb_pools: self.lb_pools.list(),
            pod_pools: self
                .pod_pools
                .as_ref()
                .map(|s| s.list())
                .unwrap_or_default(),
            services: self.services.store().entries(),
            endpoints: self.endpoints.store().entries(),
            secrets: self.secrets.as_ref().map(|s| by_name(s.list())),
            secrets_namespace: self.secrets_namespace.clone(),
            service_diff,
            endpoints_diff,
        }
    }
}

fn by_name<K: ResourceExt>(objs: Vec<Arc<K>>) -> BTreeMap<String, Arc<K>> {
    objs.into_iter().map(|o| (o.name_any(), o)).collect()
}

/// Point-in-time view of the stores used for one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub node_name: String,
    pub node: Option<Arc<Node>>,
    pub peering_policies: Vec<Arc<CiliumBGPPeeringPolicy>>,
    pub node_config: Option<Arc<CiliumBGPNodeConfig>>,
    pub peer_configs: BTreeMap<String, Arc<CiliumBGPPeerConfig>>,
    pub advertisements: Vec<Arc<CiliumBGPAdvertisement>>,
    pub lb_pools: Vec<Arc<CiliumLoadBalancerIPPool>>,
    pub pod_pools: Vec<Arc<CiliumPodIPPool>>,
    pub services: BTreeMap<ObjectKey, Arc<Service>>,
    pub endpoints: BTreeMap<ObjectKey, Arc<Endpoints>>,
    /// `None` when no secrets namespace is configured.
    pub secrets: Option<BTreeMap<String, Arc<Secret>>>,
    pub secrets_namespace: Option<String>,
    pub service_diff: Diff<Service>,
    pub endpoints_diff: Diff<Endpoints>,
}

impl Snapshot {
    pub fn node_labels(&self) -> BTreeMap<String, String> {
        self.node
            .as_ref()
            .map(|n| n.labels().clone())
            .unwrap_or_default()
    }

    pub fn node_annotations(&self) -> BTreeMap<String, String> {
        self.node
            .as_ref()
            .map(|n| n.annotations().clone())
            .unwrap_or_default()
    }

    pub fn pod_cidrs(&self) -> Vec<IpNet> {
        let spec = match self.node.as_ref().and_then(|n| n.spec.as_ref()) {
            Some(spec) => spec,
            None => return Vec::new(),
        };
        let mut cidrs: Vec<IpNet> = match &spec.pod_cidrs {
            Some(cidrs) if !cidrs.is_empty() => cidrs.iter().filter_map(|c| c.parse().ok()).collect(),
            _ => spec
                .pod_cidr
                .iter()
                .filter_map(|c| c.parse().ok())
                .collect(),
        };
        cidrs.iter_mut().for_each(|c| *c = c.trunc());
        cidrs
    }

    pub fn internal_ipv4(&self) -> Option<Ipv4Addr> {
        self.node
            .as_ref()?
            .status
            .as_ref()?
            .addresses
            .as_ref()?
            .iter()
            .filter(|a| a.type_ == "InternalIP")
            .find_map(|a| match a.address.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => Some(v4),
                _ => None,
            })
    }

    /// Password stored under `password` in the referenced secret.
    pub fn auth_password(&self, secret_ref: &str) -> Result<String, String> {
        let (secrets, ns) = match (&self.secrets, &self.secrets_namespace) {
            (Some(secrets), Some(ns)) => (secrets, ns),
            _ => {
                return Err(format!(
                    "cannot resolve auth secret {secret_ref}: BGP secrets namespace is not configured"
                ))
            }
        };
        let secret = secrets
            .get(secret_ref)
            .ok_or_else(|| format!("auth secret not found: {ns}/{secret_ref}"))?;
        if let Some(v) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(SECRET_PASSWORD_KEY))
        {
            return String::from_utf8(v.0.clone())
                .map_err(|_| format!("auth secret {ns}/{secret_ref}: password is not valid UTF-8"));
        }
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(SECRET_PASSWORD_KEY))
            .cloned()
            .ok_or_else(|| format!("auth secret {ns}/{secret_ref} has no {SECRET_PASSWORD_KEY} key"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::fixture::reconciler::{node, secret};

    #[rstest(
        secrets,
        secret_ref,
        expected,
        case(Some(vec![secret("bgp-auth", "s3cr3t")]), "bgp-auth", Ok("s3cr3t".to_string())),
        case(Some(vec![]), "bgp-auth", Err("auth secret not found: kube-system/bgp-auth".to_string())),
        case(None, "bgp-auth", Err("cannot resolve auth secret bgp-auth: BGP secrets namespace is not configured".to_string()))
    )]
    fn test_auth_password(
        secrets: Option<Vec<Secret>>,
        secret_ref: &str,
        expected: Result<String, String>,
    ) {
        let snapshot = Snapshot {
            secrets_namespace: secrets.as_ref().map(|_| "kube-system".to_string()),
            secrets: secrets.map(|s| by_name(s.into_iter().map(Arc::new).collect())),
            ..Default::default()
        };
        assert_eq!(expected, snapshot.auth_password(secret_ref));
    }

    #[test]
    fn test_node_identity() {
        let snapshot = Snapshot {
            node: Some(Arc::new(node("node1", &[("bgp", "a")], "10.244.1.0/24", "192.168.0.11"))),
            ..Default::default()
        };
        assert_eq!(Some(Ipv4Addr::new(192, 168, 0, 11)), snapshot.internal_ipv4());
        assert_eq!(vec!["10.244.1.0/24".parse::<IpNet>().unwrap()], snapshot.pod_cidrs());
        assert_eq!(Some(&"a".to_string()), snapshot.node_labels().get("bgp"));
    }

    #[test]
    fn test_stores_synced_and_snapshot() {
        let signaler = Signaler::new();
        let stores = Stores::new(&signaler, None, false);
        assert!(!stores.synced());
        use crate::store::{StoreEvent, StoreWriter};
        stores.node.apply(StoreEvent::Restarted(vec![node("node1", &[], "10.244.1.0/24", "192.168.0.11")]));
        stores.peering_policies.apply(StoreEvent::Sync);
        stores.node_configs.apply(StoreEvent::Sync);
        stores.peer_configs.apply(StoreEvent::Sync);
        stores.advertisements.apply(StoreEvent::Sync);
        stores.lb_pools.apply(StoreEvent::Sync);
        stores.services.apply(StoreEvent::Sync);
        assert!(!stores.synced());
        stores.endpoints.apply(StoreEvent::Sync);
        assert!(stores.synced());
        let snapshot = stores.snapshot("node1");
        assert!(snapshot.node.is_some());
        assert!(snapshot.secrets.is_none());
    }

    #[test]
    fn test_change_during_snapshot_stays_pending() {
        use crate::{
            fixture::reconciler::{service, ServiceParams},
            store::{StoreEvent, StoreWriter},
        };

        let signaler = Signaler::new();
        let stores = Stores::new(&signaler, None, false);
        let web = service(ServiceParams::load_balancer("default", "web", "172.16.0.10"));
        let key = ObjectKey::of(&web);
        stores.services.apply(StoreEvent::Upsert(web.clone()));

        let mut updated = web;
        updated.metadata.resource_version = Some("2".to_string());
        let snapshot = stores.snapshot_after_drain("node1", || {
            stores.services.apply(StoreEvent::Upsert(updated));
        });
        assert_eq!(1, snapshot.service_diff.upserted.len());
        assert_eq!(
            Some("2".to_string()),
            snapshot.services[&key].metadata.resource_version
        );

        let next = stores.snapshot("node1");
        assert_eq!(1, next.service_diff.upserted.len());
        assert_eq!(
            Some("2".to_string()),
            next.service_diff.upserted[0].metadata.resource_version
        );
    }
}
