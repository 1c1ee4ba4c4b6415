use std::collections::BTreeSet;

use bgpcp_bgp::speaker::GlobalConfig;

use crate::{
    crd::error::Error as CrdError,
    reconciler::{
        common::{ensure_router, resolve_router_id, router_annotation, validate_asn},
        InstanceState, ResourceError, StageResult, KIND_NODE, KIND_NODE_CONFIG,
    },
    util::parse_peer_address,
};

use super::V2Input;

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let instance = &input.instance;
    let invalid = |e: &dyn std::fmt::Display| {
        ResourceError::config_invalid(
            KIND_NODE_CONFIG,
            input.node_config_name(),
            format!("instance {}: {}", instance.name, e),
        )
    };

    let asn = instance
        .local_asn
        .ok_or(CrdError::MissingField("localASN"))
        .and_then(validate_asn)
        .map_err(|e| invalid(&e))?;

    let mut seen = BTreeSet::new();
    for peer in instance.peers.iter().flatten() {
        let raw = match &peer.peer_address {
            Some(raw) => raw,
            None => continue,
        };
        let addr = parse_peer_address(raw)
            .ok_or_else(|| invalid(&CrdError::InvalidPeerAddress(raw.clone())))?;
        if !seen.insert(addr) {
            return Err(invalid(&format!("duplicate peer address {addr}")));
        }
    }

    let snapshot = input.snapshot.as_ref();
    let annotation = router_annotation(&snapshot.node_annotations(), asn)
        .map_err(|e| ResourceError::config_invalid(KIND_NODE, &snapshot.node_name, e))?;
    let router_id = resolve_router_id(instance.router_id.as_deref(), &annotation, snapshot)?;
    let listen_port = match instance.local_port {
        Some(p) => Some(
            u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid(&CrdError::InvalidPort(p)))?,
        ),
        None => annotation.local_port,
    };

    let global = GlobalConfig {
        asn,
        router_id,
        listen_port,
    };
    ensure_router(input.manager.as_ref(), global, state).await?;
    Ok(Vec::new())
}
