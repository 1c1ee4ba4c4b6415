use crate::{
    crd::advertisement::AdvertisementType,
    reconciler::{
        common::{global, sync_paths},
        ErrorClass, InstanceState, ResourceError, StageResult, KIND_SERVICE,
    },
};

use super::{
    peer_advertisement::{desired_routes, service_owner},
    V2Input, STAGE_SERVICE,
};

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let desired = desired_routes(input).prefixes(AdvertisementType::Service);
    let failures = sync_paths(input.manager.as_ref(), global.asn, STAGE_SERVICE, &desired, state).await;
    Ok(failures
        .into_iter()
        .map(|(prefix, e)| {
            let owner = service_owner(&input.snapshot, &prefix)
                .map(|k| k.to_string())
                .unwrap_or_else(|| prefix.to_string());
            ResourceError::new(ErrorClass::Partial, KIND_SERVICE, &owner, format!("{prefix}: {e}"))
        })
        .collect())
}
