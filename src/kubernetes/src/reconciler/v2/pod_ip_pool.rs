use kube::ResourceExt;

use crate::{
    crd::advertisement::AdvertisementType,
    reconciler::{
        common::{global, sync_paths},
        ErrorClass, InstanceState, ResourceError, StageResult, KIND_POD_IP_POOL,
    },
};

use super::{peer_advertisement::desired_routes, V2Input, STAGE_POD_IP_POOL};

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let desired = desired_routes(input).prefixes(AdvertisementType::CiliumPodIPPool);
    let failures = sync_paths(input.manager.as_ref(), global.asn, STAGE_POD_IP_POOL, &desired, state).await;
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
