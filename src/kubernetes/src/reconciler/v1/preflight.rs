use std::collections::BTreeSet;

use bgpcp_bgp::speaker::GlobalConfig;

use crate::{
    crd::error::Error as CrdError,
    reconciler::{
        common::{ensure_router, resolve_router_id, router_annotation, validate_asn},
        InstanceState, ResourceError, StageResult, KIND_NODE, KIND_PEERING_POLICY,
    },
    util::parse_peer_address,
};

use super::V1Input;

pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let policy = input.policy_name.as_str();
    let invalid = |e: &dyn std::fmt::Display| {
        ResourceError::config_invalid(KIND_PEERING_POLICY, policy, e)
    };

    let asn = validate_asn(input.router.local_asn).map_err(|e| invalid(&e))?;

    let mut seen = BTreeSet::new();
    for neighbor in input.router.neighbors.iter() {
        let addr = parse_peer_address(&neighbor.peer_address)
            .ok_or_else(|| invalid(&CrdError::InvalidPeerAddress(neighbor.peer_address.clone())))?;
        validate_asn(neighbor.peer_asn).map_err(|e| invalid(&e))?;
        if !seen.insert(addr) {
            return Err(invalid(&format!("duplicate peer address {addr}")));
        }
    }

    let snapshot = input.snapshot.as_ref();
    let annotation = router_annotation(&snapshot.node_annotations(), asn)
        .map_err(|e| ResourceError::config_invalid(KIND_NODE, &snapshot.node_name, e))?;
    let router_id = resolve_router_id(None, &annotation, snapshot)?;

    let global = GlobalConfig {
        asn,
        router_id,
        listen_port: annotation.local_port,
    };
    ensure_router(input.manager.as_ref(), global, state).await?;
    Ok(Vec::new())
}
