use crate::{
    crd::advertisement::AdvertisementType,
    reconciler::{
        common::{global, sync_paths},
        ErrorClass, InstanceState, ResourceError, StageResult, KIND_NODE,
    },
};

use super::{peer_advertisement::desired_routes, V2Input, STAGE_POD_CIDR};

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let desired = desired_routes(input).prefixes(AdvertisementType::PodCIDR);
    let failures = sync_paths(input.manager.as_ref(), global.asn, STAGE_POD_CIDR, &desired, state).await;
    Ok(failures
        .into_iter()
        .map(|(prefix, e)| {
            ResourceError::new(
                ErrorClass::Partial,
                KIND_NODE,
                &input.snapshot.node_name,
                format!("{prefix}: {e}"),
            )
        })
        .collect())
}
