use std::collections::BTreeSet;

use ipnet::IpNet;
use kube::ResourceExt;

use crate::{
    reconciler::{
        common::{global, sync_paths},
        ErrorClass, InstanceState, ResourceError, StageResult, KIND_PEERING_POLICY,
        KIND_POD_IP_POOL,
    },
    selector::{self, Unset},
};

use super::{V1Input, STAGE_POD_IP_POOL};

pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let selector = input.router.pod_ip_pool_selector.as_ref();

    let mut desired: BTreeSet<IpNet> = BTreeSet::new();
    for pool in input.snapshot.pod_pools.iter() {
        if pool.spec.disabled {
            continue;
        }
        let selected = selector::matches(selector, pool.labels(), Unset::MatchNone)
            .map_err(|e| ResourceError::config_invalid(KIND_PEERING_POLICY, &input.policy_name, e))?;
        if selected {
            desired.extend(pool.cidrs());
        }
    }

    let failures = sync_paths(
        input.manager.as_ref(),
        global.asn,
        STAGE_POD_IP_POOL,
        &desired,
        state,
    )
    .await;
    Ok(failures
        .into_iter()
        .map(|(prefix, e)| {
            let pool = input
                .snapshot
                .pod_pools
                .iter()
                .find(|p| p.cidrs().contains(&prefix))
                .map(|p| p.name_any())
                .unwrap_or_else(|| prefix.to_string());
            ResourceError::new(ErrorClass::Partial, KIND_POD_IP_POOL, &pool, format!("{prefix}: {e}"))
        })
        .collect())
}
