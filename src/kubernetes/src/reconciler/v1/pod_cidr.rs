use std::collections::BTreeSet;

use ipnet::IpNet;

use crate::reconciler::{
    common::{global, sync_paths},
    ErrorClass, InstanceState, ResourceError, StageResult, KIND_NODE,
};

use super::{V1Input, STAGE_EXPORT_POD_CIDR};

pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let desired: BTreeSet<IpNet> = if input.router.export_pod_cidr.unwrap_or(false) {
        input.snapshot.pod_cidrs().into_iter().collect()
    } else {
        BTreeSet::new()
    };
    let failures = sync_paths(
        input.manager.as_ref(),
        global.asn,
        STAGE_EXPORT_POD_CIDR,
        &desired,
        state,
    )
    .await;
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
