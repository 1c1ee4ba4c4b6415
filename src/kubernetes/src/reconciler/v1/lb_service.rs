use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::LabelSelector};

use crate::{
    reconciler::{
        common::{
            global, has_eligible_endpoint, host_prefixes, is_load_balancer, load_balancer_ips,
            service_labels, sync_paths, TrafficPolicy,
        },
        snapshot::Snapshot,
        ErrorClass, InstanceState, ResourceError, StageResult, KIND_PEERING_POLICY, KIND_SERVICE,
    },
    selector::{self, Unset},
    store::ObjectKey,
};

use super::{V1Input, STAGE_LB_SERVICE};

fn desired_for(svc: &Service, selector: Option<&LabelSelector>, snapshot: &Snapshot) -> BTreeSet<IpNet> {
    if !is_load_balancer(svc) {
        return BTreeSet::new();
    }
    // The selector was validated up front.
    if !selector::matches(selector, &service_labels(svc), Unset::MatchNone).unwrap_or(false) {
        return BTreeSet::new();
    }
    let endpoints = snapshot.endpoints.get(&ObjectKey::of(svc)).map(|e| e.as_ref());
    if !has_eligible_endpoint(svc, endpoints, &snapshot.node_name, TrafficPolicy::External) {
        return BTreeSet::new();
    }
    host_prefixes(&load_balancer_ips(svc))
}

/// Keys touched by the service and endpoints diffs of this pass.
fn affected(snapshot: &Snapshot) -> BTreeSet<ObjectKey> {
    let services = snapshot
        .service_diff
        .upserted
        .iter()
        .chain(snapshot.service_diff.deleted.iter())
        .map(|s| ObjectKey::of(s.as_ref()));
    let endpoints = snapshot
        .endpoints_diff
        .upserted
        .iter()
        .chain(snapshot.endpoints_diff.deleted.iter())
        .map(|e| ObjectKey::of(e.as_ref()));
    services.chain(endpoints).collect()
}

/// Announce load balancer IPs of selected services. Runs incrementally from
/// the service and endpoints diffs once a full pass succeeded with the
/// current selector.
pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let snapshot = input.snapshot.as_ref();
    let selector = input.router.service_selector.clone();

    selector::matches(selector.as_ref(), &BTreeMap::new(), Unset::MatchNone)
        .map_err(|e| ResourceError::config_invalid(KIND_PEERING_POLICY, &input.policy_name, e))?;

    let full = !state.service_synced || state.service_selector.as_ref() != Some(&selector);
    let keys: BTreeSet<ObjectKey> = if full {
        tracing::debug!(asn = global.asn, "full service reconciliation");
        snapshot
            .services
            .keys()
            .chain(state.service_paths.keys())
            .cloned()
            .collect()
    } else {
        affected(snapshot)
    };

    for key in keys.into_iter() {
        let desired = snapshot
            .services
            .get(&key)
            .map(|svc| desired_for(svc, selector.as_ref(), snapshot))
            .unwrap_or_default();
        if desired.is_empty() {
            state.service_paths.remove(&key);
        } else {
            state.service_paths.insert(key, desired);
        }
    }

    let union: BTreeSet<IpNet> = state.service_paths.values().flatten().cloned().collect();
    let failures = sync_paths(input.manager.as_ref(), global.asn, STAGE_LB_SERVICE, &union, state).await;
    if failures.is_empty() {
        state.service_synced = true;
        state.service_selector = Some(selector);
        return Ok(Vec::new());
    }

    state.service_synced = false;
    Ok(failures
        .into_iter()
        .map(|(prefix, e)| {
            let owner = state
                .service_paths
                .iter()
                .find(|(_, prefixes)| prefixes.contains(&prefix))
                .map(|(key, _)| key.to_string())
                .unwrap_or_else(|| prefix.to_string());
            ResourceError::new(ErrorClass::Partial, KIND_SERVICE, &owner, format!("{prefix}: {e}"))
        })
        .collect())
}
