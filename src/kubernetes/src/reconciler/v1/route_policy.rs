use bgpcp_bgp::policy::{
    Actions, Conditions, PolicyDirection, PrefixMatch, RouteAction, RoutePolicy, Statement,
};
use kube::ResourceExt;

use crate::{
    crd::{
        advertisement::BGPAttributes,
        peering_policy::{CiliumBGPPathAttributes, PathAttributesSelectorType},
    },
    reconciler::{
        common::global, snapshot::Snapshot, InstanceState, ResourceError, StageResult,
        KIND_PEERING_POLICY, KIND_ROUTER,
    },
    selector::{self, Unset},
    util::parse_peer_address,
};

use super::V1Input;

fn selector_type_name(t: PathAttributesSelectorType) -> &'static str {
    match t {
        PathAttributesSelectorType::PodCIDR => "PodCIDR",
        PathAttributesSelectorType::CiliumLoadBalancerIPPool => "CiliumLoadBalancerIPPool",
        PathAttributesSelectorType::CiliumPodIPPool => "CiliumPodIPPool",
    }
}

/// Prefixes an attribute entry applies to. An unset selector selects every
/// object of its type.
fn selected_prefixes(
    attrs: &CiliumBGPPathAttributes,
    snapshot: &Snapshot,
) -> Result<Vec<PrefixMatch>, crate::error::Error> {
    let selector = attrs.selector.as_ref();
    let prefixes = match attrs.selector_type {
        PathAttributesSelectorType::PodCIDR => {
            if selector::matches(selector, &snapshot.node_labels(), Unset::MatchAll)? {
                snapshot
                    .pod_cidrs()
                    .into_iter()
                    .map(PrefixMatch::exact)
                    .collect()
            } else {
                Vec::new()
            }
        }
        PathAttributesSelectorType::CiliumLoadBalancerIPPool => {
            let mut prefixes = Vec::new();
            for pool in snapshot.lb_pools.iter() {
                if pool.spec.disabled
                    || !selector::matches(selector, pool.labels(), Unset::MatchAll)?
                {
                    continue;
                }
                // Services get host routes out of the pool.
                prefixes.extend(pool.cidrs().into_iter().map(|cidr| PrefixMatch {
                    cidr,
                    prefix_len_min: cidr.prefix_len(),
                    prefix_len_max: cidr.max_prefix_len(),
                }));
            }
            prefixes
        }
        PathAttributesSelectorType::CiliumPodIPPool => {
            let mut prefixes = Vec::new();
            for pool in snapshot.pod_pools.iter() {
                if pool.spec.disabled
                    || !selector::matches(selector, pool.labels(), Unset::MatchAll)?
                {
                    continue;
                }
                prefixes.extend(pool.cidrs().into_iter().map(PrefixMatch::exact));
            }
            prefixes
        }
    };
    Ok(prefixes)
}

/// Export policies setting the advertised path attributes of every
/// neighbor. They never filter.
pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let router = &input.router;
    let mut errors = Vec::new();
    let mut policies = Vec::new();

    for neighbor in router.neighbors.iter() {
        let addr = match parse_peer_address(&neighbor.peer_address) {
            Some(addr) => addr,
            None => continue,
        };
        let ibgp = neighbor.peer_asn == router.local_asn;
        for (i, entry) in neighbor
            .advertised_path_attributes
            .iter()
            .flatten()
            .enumerate()
        {
            let invalid = |e: &dyn std::fmt::Display| {
                ResourceError::config_invalid(
                    KIND_PEERING_POLICY,
                    &input.policy_name,
                    format!("neighbor {}: {}", neighbor.peer_address, e),
                )
            };
            let attributes = BGPAttributes {
                communities: entry.communities.clone(),
                local_preference: entry.local_preference,
            };
            let attributes = match attributes.to_path_attributes(ibgp) {
                Ok(a) => a,
                Err(e) => {
                    errors.push(invalid(&e));
                    continue;
                }
            };
            let prefixes = match selected_prefixes(entry, &input.snapshot) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(invalid(&e));
                    continue;
                }
            };
            if prefixes.is_empty() {
                continue;
            }
            let name = format!("{}-{}-{}", addr, selector_type_name(entry.selector_type), i);
            policies.push(
                RoutePolicy::new(&name, PolicyDirection::Export).statement(Statement {
                    conditions: Conditions {
                        match_neighbors: vec![addr],
                        match_prefixes: prefixes,
                        match_families: Vec::new(),
                    },
                    actions: Actions {
                        route_action: RouteAction::None,
                        add_communities: attributes.communities,
                        add_large_communities: attributes.large_communities,
                        set_local_preference: attributes.local_preference,
                    },
                }),
            );
        }
    }

    input
        .manager
        .set_policies(global.asn, &policies)
        .await
        .map_err(|e| ResourceError::from_bgp(KIND_ROUTER, &global.asn.to_string(), &e))?;
    Ok(errors)
}
