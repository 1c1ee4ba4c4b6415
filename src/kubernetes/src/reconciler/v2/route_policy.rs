use bgpcp_bgp::{
    path::PathAttributes,
    policy::{Actions, Conditions, PolicyDirection, PrefixMatch, RouteAction, RoutePolicy, Statement},
};

use crate::reconciler::{
    common::global, InstanceState, ResourceError, StageResult, KIND_ROUTER,
};

use super::{
    peer_advertisement::{desired_routes, PeerRoutes},
    V2Input,
};

/// Export policy accepting exactly the routes selected for the peer, with
/// their attributes, and rejecting everything else.
pub(crate) fn export_policy(peer: &PeerRoutes) -> Option<RoutePolicy> {
    let address = peer.address?;
    let mut groups: Vec<(PathAttributes, Vec<PrefixMatch>)> = Vec::new();
    for (prefix, attrs) in peer.routes.iter() {
        match groups.iter_mut().find(|(a, _)| a == attrs) {
            Some((_, prefixes)) => prefixes.push(PrefixMatch::exact(*prefix)),
            None => groups.push((attrs.clone(), vec![PrefixMatch::exact(*prefix)])),
        }
    }

    let mut policy = RoutePolicy::new(&format!("{}-export", peer.name), PolicyDirection::Export);
    for (attrs, prefixes) in groups.into_iter() {
        policy = policy.statement(Statement {
            conditions: Conditions {
                match_neighbors: vec![address],
                match_prefixes: prefixes,
                match_families: Vec::new(),
            },
            actions: Actions {
                route_action: RouteAction::Accept,
                add_communities: attrs.communities,
                add_large_communities: attrs.large_communities,
                set_local_preference: attrs.local_preference,
            },
        });
    }
    Some(policy.statement(Statement {
        conditions: Conditions {
            match_neighbors: vec![address],
            ..Default::default()
        },
        actions: Actions {
            route_action: RouteAction::Reject,
            ..Default::default()
        },
    }))
}

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let desired = desired_routes(input);
    let configured = input
        .manager
        .router(global.asn)
        .map(|r| r.neighbors.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let policies: Vec<RoutePolicy> = desired
        .peers
        .iter()
        .filter(|p| p.address.map(|a| configured.contains(&a)).unwrap_or(false))
        .filter_map(export_policy)
        .collect();

    input
        .manager
        .set_policies(global.asn, &policies)
        .await
        .map_err(|e| ResourceError::from_bgp(KIND_ROUTER, &global.asn.to_string(), &e))?;
    Ok(desired.errors)
}
