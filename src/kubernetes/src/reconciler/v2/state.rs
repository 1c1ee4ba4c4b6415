//! Runtime state read back from the routers and written to the status of
//! the `CiliumBGPNodeConfig` of this node.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};

use async_trait::async_trait;
use bgpcp_bgp::{
    error::Error as BgpError,
    manager::RouterManager,
    path::{RouteQuery, TableType},
    peer::PeerStatus,
};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;

use crate::{
    crd::node_config::{
        BGPFamilyRouteCount, CiliumBGPNodeConfig, CiliumBGPNodeConfigStatus,
        CiliumBGPNodeInstanceStatus, CiliumBGPNodePeerStatus, CiliumBGPTimersState,
        CONDITION_RECONCILE_ERROR, PEER_STATE_NOT_READY,
    },
    error::Error,
    reconciler::{ResourceError, KIND_NODE_CONFIG},
    tables::ReconcileError,
    util::parse_peer_address,
};

pub const STATUS_FIELD_MANAGER: &str = "bgpcp-agent";
pub const REASON_RECONCILE_ERROR: &str = "BGPReconcileError";
pub const REASON_NO_ERROR: &str = "NoReconcileError";

#[async_trait]
pub trait NodeConfigStatusWriter: Send + Sync {
    async fn write(&self, name: &str, status: &CiliumBGPNodeConfigStatus) -> Result<(), Error>;
}

/// Writes the status subresource through the API server.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        KubeStatusWriter { client }
    }
}

#[async_trait]
impl NodeConfigStatusWriter for KubeStatusWriter {
    #[tracing::instrument(skip_all, fields(name))]
    async fn write(&self, name: &str, status: &CiliumBGPNodeConfigStatus) -> Result<(), Error> {
        let api = Api::<CiliumBGPNodeConfig>::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(STATUS_FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::Kube)?;
        tracing::debug!("node config status updated");
        Ok(())
    }
}

pub struct StatusReconciler {
    writer: Arc<dyn NodeConfigStatusWriter>,
    last: Option<CiliumBGPNodeConfigStatus>,
}

impl StatusReconciler {
    pub fn new(writer: Arc<dyn NodeConfigStatusWriter>) -> Self {
        StatusReconciler { writer, last: None }
    }

    /// Forget the last written status, the next pass writes unconditionally
    /// unless the stored status already matches.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Build the status of `config` and write it when it differs from what
    /// the object carries. `not_ready` lists the unresolved peers of each
    /// instance. Returns whether a write happened.
    pub async fn reconcile(
        &mut self,
        manager: &dyn RouterManager,
        config: &CiliumBGPNodeConfig,
        errors: &[ReconcileError],
        not_ready: &BTreeMap<String, BTreeSet<String>>,
        now: DateTime<Utc>,
    ) -> Result<bool, ResourceError> {
        let name = config.name_any();
        let previous = self.last.as_ref().or(config.status.as_ref());
        let status = build_status(manager, config, errors, not_ready, previous, now).await;

        if config.status.as_ref() == Some(&status) || self.last.as_ref() == Some(&status) {
            return Ok(false);
        }
        self.writer
            .write(&name, &status)
            .await
            .map_err(|e| ResourceError::transient(KIND_NODE_CONFIG, &name, e))?;
        self.last = Some(status);
        Ok(true)
    }
}

async fn peer_statuses(manager: &dyn RouterManager, asn: u32) -> Vec<PeerStatus> {
    match manager.get_peers(Some(asn)).await {
        Ok(peers) => peers,
        Err(BgpError::RouterNotFound { .. }) => Vec::new(),
        Err(e) => {
            tracing::warn!(asn, error = %e, "failed to read peer state");
            Vec::new()
        }
    }
}

async fn route_count(manager: &dyn RouterManager, asn: u32, peer: &PeerStatus) -> Vec<BGPFamilyRouteCount> {
    let mut counts = Vec::new();
    for family in peer.families.iter() {
        let count = |table| {
            let query = RouteQuery {
                family: Some(*family),
                table,
                neighbor: Some(peer.address),
            };
            async move {
                manager
                    .get_routes(Some(asn), &query)
                    .await
                    .map(|r| r.len() as i32)
                    .ok()
            }
        };
        counts.push(BGPFamilyRouteCount {
            afi: family.afi.to_string(),
            safi: family.safi.to_string(),
            received: count(TableType::AdjRibIn).await,
            advertised: count(TableType::AdjRibOut).await,
        });
    }
    counts
}

async fn build_status(
    manager: &dyn RouterManager,
    config: &CiliumBGPNodeConfig,
    errors: &[ReconcileError],
    not_ready: &BTreeMap<String, BTreeSet<String>>,
    previous: Option<&CiliumBGPNodeConfigStatus>,
    now: DateTime<Utc>,
) -> CiliumBGPNodeConfigStatus {
    let mut instances = Vec::new();
    for instance in config.spec.bgp_instances.iter() {
        let runtime = match instance.local_asn.and_then(|asn| u32::try_from(asn).ok()) {
            Some(asn) => Some((asn, peer_statuses(manager, asn).await)),
            None => None,
        };
        let mut peers = Vec::new();
        for peer in instance.peers.iter().flatten() {
            let address = match peer.peer_address.as_deref() {
                Some(a) => a,
                None => continue,
            };
            let mut status = CiliumBGPNodePeerStatus {
                name: peer.name.clone(),
                peer_address: address.to_string(),
                peer_asn: peer.peer_asn,
                ..Default::default()
            };
            let unresolved = not_ready
                .get(&instance.name)
                .map(|peers| peers.contains(&peer.name))
                .unwrap_or(false);
            if unresolved {
                status.peering_state = Some(PEER_STATE_NOT_READY.to_string());
                peers.push(status);
                continue;
            }
            let current = runtime.as_ref().and_then(|(asn, statuses)| {
                let addr: IpAddr = parse_peer_address(address)?;
                statuses
                    .iter()
                    .find(|s| s.address == addr)
                    .map(|s| (*asn, s))
            });
            if let Some((asn, s)) = current {
                status.peer_asn = Some(i64::from(s.peer_asn));
                status.peering_state = Some(s.state.as_str().to_string());
                status.timers = Some(CiliumBGPTimersState {
                    applied_hold_time_seconds: i32::try_from(s.timers.hold_time_secs).ok(),
                    applied_keepalive_seconds: i32::try_from(s.timers.keepalive_secs).ok(),
                });
                status.route_count = route_count(manager, asn, s).await;
            }
            peers.push(status);
        }
        instances.push(CiliumBGPNodeInstanceStatus {
            name: instance.name.clone(),
            local_asn: instance.local_asn,
            peers,
        });
    }

    CiliumBGPNodeConfigStatus {
        bgp_instances: instances,
        conditions: vec![error_condition(
            errors,
            config.metadata.generation,
            previous,
            now,
        )],
    }
}

fn error_condition(
    errors: &[ReconcileError],
    generation: Option<i64>,
    previous: Option<&CiliumBGPNodeConfigStatus>,
    now: DateTime<Utc>,
) -> Condition {
    let (status, reason, message) = if errors.is_empty() {
        ("False", REASON_NO_ERROR, String::new())
    } else {
        let message = errors
            .iter()
            .map(|e| {
                format!(
                    "{}: {} {}: {}",
                    e.instance, e.resource_kind, e.resource_name, e.error
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        ("True", REASON_RECONCILE_ERROR, message)
    };

    let last_transition_time = previous
        .and_then(|p| {
            p.conditions
                .iter()
                .find(|c| c.type_ == CONDITION_RECONCILE_ERROR && c.status == status)
        })
        .map(|c| c.last_transition_time.clone())
        .unwrap_or(Time(now));

    Condition {
        type_: CONDITION_RECONCILE_ERROR.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time,
    }
}
