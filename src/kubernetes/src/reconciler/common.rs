use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr},
};

use bgpcp_bgp::{
    error::Error as BgpError,
    manager::RouterManager,
    path::Path,
    speaker::GlobalConfig,
};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;

use crate::{crd::error::Error as CrdError, util::host_prefix};

use super::{
    snapshot::Snapshot, ErrorClass, InstanceState, ResourceError, KIND_NODE, KIND_PEER, KIND_ROUTER,
};

pub const ROUTER_ANNOTATION_PREFIX: &str = "cilium.io/bgp-virtual-router.";
pub const SERVICE_NAME_LABEL: &str = "io.kubernetes.service.name";
pub const SERVICE_NAMESPACE_LABEL: &str = "io.kubernetes.service.namespace";
pub const BGP_LOAD_BALANCER_CLASS: &str = "io.cilium/bgp-control-plane";

const RESERVED_ASNS: [u32; 3] = [23456, 65535, u32::MAX];

/// Overrides carried by the `cilium.io/bgp-virtual-router.<asn>` node
/// annotation, e.g. `router-id=10.0.0.2,local-port=1790`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterAnnotation {
    pub router_id: Option<Ipv4Addr>,
    pub local_port: Option<u16>,
}

pub fn router_annotation(
    annotations: &BTreeMap<String, String>,
    asn: u32,
) -> Result<RouterAnnotation, String> {
    let key = format!("{ROUTER_ANNOTATION_PREFIX}{asn}");
    let value = match annotations.get(&key) {
        Some(v) => v,
        None => return Ok(RouterAnnotation::default()),
    };
    let mut annotation = RouterAnnotation::default();
    for kv in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| format!("annotation {key}: malformed entry {kv:?}"))?;
        match k.trim() {
            "router-id" => {
                annotation.router_id = Some(
                    v.trim()
                        .parse()
                        .map_err(|_| format!("annotation {key}: invalid router-id {v:?}"))?,
                )
            }
            "local-port" => {
                annotation.local_port = Some(
                    v.trim()
                        .parse()
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or_else(|| format!("annotation {key}: invalid local-port {v:?}"))?,
                )
            }
            other => tracing::debug!(key = other, "ignoring unknown router annotation entry"),
        }
    }
    Ok(annotation)
}

/// ASNs usable for a router or a peer.
pub fn validate_asn(asn: i64) -> Result<u32, CrdError> {
    let valid = u32::try_from(asn)
        .ok()
        .filter(|a| *a != 0 && !RESERVED_ASNS.contains(a));
    valid.ok_or(CrdError::InvalidAsn(asn))
}

/// Router id from an explicit value, then the node annotation, then the
/// node's IPv4 InternalIP.
pub fn resolve_router_id(
    explicit: Option<&str>,
    annotation: &RouterAnnotation,
    snapshot: &Snapshot,
) -> Result<Ipv4Addr, ResourceError> {
    if let Some(id) = explicit {
        return id.parse().map_err(|_| {
            ResourceError::config_invalid(KIND_NODE, &snapshot.node_name, CrdError::InvalidRouterId(id.to_string()))
        });
    }
    if let Some(id) = annotation.router_id {
        return Ok(id);
    }
    snapshot.internal_ipv4().ok_or_else(|| {
        ResourceError::config_invalid(
            KIND_NODE,
            &snapshot.node_name,
            "router id cannot be resolved: no annotation and no IPv4 InternalIP",
        )
    })
}

/// Make sure the router for `desired` runs with exactly that global
/// configuration. A router id or listen port change recreates it, a local
/// ASN change tears the previous one down.
pub async fn ensure_router(
    manager: &dyn RouterManager,
    desired: GlobalConfig,
    state: &mut InstanceState,
) -> Result<(), ResourceError> {
    let asn = desired.asn;
    let router_err = |e: &BgpError| ResourceError::from_bgp(KIND_ROUTER, &asn.to_string(), e);

    if let Some(prev) = state.global.clone() {
        if prev.asn != asn {
            tracing::info!(from = prev.asn, to = asn, "local ASN changed, tearing down router");
            teardown(manager, state)
                .await
                .map_err(|e| ResourceError::from_bgp(KIND_ROUTER, &prev.asn.to_string(), &e))?;
        }
    }

    match manager.router(asn) {
        Some(current) if current.global == desired => {}
        Some(current) => {
            tracing::info!(
                asn,
                router_id = %desired.router_id,
                previous_router_id = %current.global.router_id,
                "global configuration changed, recreating router"
            );
            manager.destroy_router(asn).await.map_err(|e| router_err(&e))?;
            state.reset_router();
            manager.create_router(&desired).await.map_err(|e| router_err(&e))?;
        }
        None => {
            state.reset_router();
            manager.create_router(&desired).await.map_err(|e| router_err(&e))?;
            tracing::info!(asn, router_id = %desired.router_id, "created router");
        }
    }
    state.global = Some(desired);
    Ok(())
}

/// Global configuration set by the preflight stage.
pub fn global(state: &InstanceState) -> Result<GlobalConfig, ResourceError> {
    state
        .global
        .clone()
        .ok_or_else(|| ResourceError::transient(KIND_ROUTER, "unknown", "router is not initialized"))
}

/// Converge the paths owned by `stage` to `desired`. A prefix still owned by
/// another stage stays advertised.
pub async fn sync_paths(
    manager: &dyn RouterManager,
    asn: u32,
    stage: &'static str,
    desired: &BTreeSet<IpNet>,
    state: &mut InstanceState,
) -> Vec<(IpNet, BgpError)> {
    let mut failures = Vec::new();
    let current = state.owned_paths.remove(stage).unwrap_or_default();
    let others: BTreeSet<IpNet> = state.advertised();
    let mut owned = BTreeSet::new();

    for prefix in desired.iter() {
        match manager.advertise_path(asn, &Path::new(*prefix)).await {
            Ok(()) => {
                owned.insert(*prefix);
            }
            Err(e) => {
                // A prefix advertised earlier may still be out there.
                if current.contains(prefix) {
                    owned.insert(*prefix);
                }
                failures.push((*prefix, e));
            }
        }
    }
    for prefix in current.difference(desired) {
        if others.contains(prefix) {
            continue;
        }
        if let Err(e) = manager.withdraw_path(asn, &Path::new(*prefix)).await {
            // Still advertised, keep tracking it.
            owned.insert(*prefix);
            failures.push((*prefix, e));
        }
    }
    if !owned.is_empty() {
        state.owned_paths.insert(stage, owned);
    }
    failures
}

/// Withdraw every path, remove every peer and destroy the router of the
/// instance.
pub async fn teardown(manager: &dyn RouterManager, state: &mut InstanceState) -> Result<(), BgpError> {
    let global = match state.global.take() {
        Some(g) => g,
        None => return Ok(()),
    };
    let mut errors = Vec::new();
    if let Some(router) = manager.router(global.asn) {
        for path in router.paths.values() {
            if let Err(e) = manager.withdraw_path(global.asn, path).await {
                errors.push(e);
            }
        }
        if let Err(e) = manager.configure_peers(&router.global, &[]).await {
            errors.push(e);
        }
    }
    if let Err(e) = manager.destroy_router(global.asn).await {
        errors.push(e);
    }
    state.reset_router();
    tracing::info!(asn = global.asn, "tore down router");
    BgpError::batch(errors)
}

/// Split a `configure_peers` failure into per-peer rows. Anything that is
/// not tied to a single peer fails the stage.
pub fn peer_errors(
    e: &BgpError,
    asn: u32,
    name_of: impl Fn(IpAddr) -> String,
) -> Result<Vec<ResourceError>, ResourceError> {
    let mut rows = Vec::new();
    for leaf in e.leaves() {
        match leaf {
            BgpError::Peer { addr, source } => rows.push(ResourceError::new(
                ErrorClass::Partial,
                KIND_PEER,
                &name_of(*addr),
                source,
            )),
            other => return Err(ResourceError::from_bgp(KIND_ROUTER, &asn.to_string(), other)),
        }
    }
    Ok(rows)
}

/// Service labels extended with the virtual name and namespace labels.
pub fn service_labels(svc: &Service) -> BTreeMap<String, String> {
    let mut labels = svc.labels().clone();
    labels.insert(SERVICE_NAME_LABEL.to_string(), svc.name_any());
    labels.insert(
        SERVICE_NAMESPACE_LABEL.to_string(),
        svc.namespace().unwrap_or_default(),
    );
    labels
}

pub fn is_load_balancer(svc: &Service) -> bool {
    let spec = match &svc.spec {
        Some(spec) => spec,
        None => return false,
    };
    spec.type_.as_deref() == Some("LoadBalancer")
        && match spec.load_balancer_class.as_deref() {
            None => true,
            Some(class) => class == BGP_LOAD_BALANCER_CLASS,
        }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficPolicy {
    External,
    Internal,
}

/// Whether the service has a ready endpoint that makes announcing it from
/// this node useful. `Local` policies need a ready endpoint on this node,
/// `Cluster` ones any ready endpoint.
pub fn has_eligible_endpoint(
    svc: &Service,
    endpoints: Option<&Endpoints>,
    node_name: &str,
    policy: TrafficPolicy,
) -> bool {
    let spec = match &svc.spec {
        Some(spec) => spec,
        None => return false,
    };
    let value = match policy {
        TrafficPolicy::External => spec.external_traffic_policy.as_deref(),
        TrafficPolicy::Internal => spec.internal_traffic_policy.as_deref(),
    };
    let local = value == Some("Local");
    endpoints
        .and_then(|ep| ep.subsets.as_ref())
        .into_iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten())
        .any(|addr| !local || addr.node_name.as_deref() == Some(node_name))
}

fn parse_ips<'a>(values: impl Iterator<Item = &'a String>) -> Vec<IpAddr> {
    values.filter_map(|v| v.parse::<IpAddr>().ok()).collect()
}

pub fn load_balancer_ips(svc: &Service) -> Vec<IpAddr> {
    parse_ips(
        svc.status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|i| i.ip.as_ref()),
    )
}

pub fn cluster_ips(svc: &Service) -> Vec<IpAddr> {
    let spec = match &svc.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };
    let mut ips = match &spec.cluster_ips {
        Some(ips) if !ips.is_empty() => parse_ips(ips.iter()),
        _ => parse_ips(spec.cluster_ip.iter()),
    };
    ips.dedup();
    ips
}

pub fn external_ips(svc: &Service) -> Vec<IpAddr> {
    svc.spec
        .as_ref()
        .map(|s| parse_ips(s.external_ips.iter().flatten()))
        .unwrap_or_default()
}

pub fn host_prefixes(addrs: &[IpAddr]) -> BTreeSet<IpNet> {
    addrs.iter().map(|a| host_prefix(*a)).collect()
}
