//! Pipeline driven by a single `CiliumBGPPeeringPolicy` selecting the node.
//! Every virtual router of the policy is an instance named `asn-<localASN>`.

pub mod lb_service;
pub mod neighbor;
pub mod pod_cidr;
pub mod pod_ip_pool;
pub mod preflight;
pub mod route_policy;

use std::sync::Arc;

use async_trait::async_trait;
use bgpcp_bgp::manager::RouterManager;

use crate::crd::peering_policy::CiliumBGPVirtualRouter;

use super::{
    snapshot::Snapshot, InstanceState, ReconcileContext, Reconciler, StageReport, StageResult,
    StageStatus,
};

pub const STAGE_PREFLIGHT: &str = "Preflight";
pub const STAGE_NEIGHBOR: &str = "Neighbor";
pub const STAGE_ROUTE_POLICY: &str = "RoutePolicy";
pub const STAGE_EXPORT_POD_CIDR: &str = "ExportPodCIDR";
pub const STAGE_LB_SERVICE: &str = "LBService";
pub const STAGE_POD_IP_POOL: &str = "PodIPPool";

pub fn instance_name(local_asn: i64) -> String {
    format!("asn-{local_asn}")
}

/// Desired state of one virtual router.
pub struct V1Input {
    pub manager: Arc<dyn RouterManager>,
    pub snapshot: Arc<Snapshot>,
    pub policy_name: String,
    pub router: CiliumBGPVirtualRouter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V1Stage {
    Preflight,
    Neighbor,
    RoutePolicy,
    ExportPodCIDR,
    LBService,
    PodIPPool,
}

impl V1Stage {
    pub const PIPELINE: [V1Stage; 6] = [
        V1Stage::Preflight,
        V1Stage::Neighbor,
        V1Stage::RoutePolicy,
        V1Stage::ExportPodCIDR,
        V1Stage::LBService,
        V1Stage::PodIPPool,
    ];
}

#[async_trait]
impl Reconciler for V1Stage {
    type Input = V1Input;

    fn name(&self) -> &'static str {
        match self {
            V1Stage::Preflight => STAGE_PREFLIGHT,
            V1Stage::Neighbor => STAGE_NEIGHBOR,
            V1Stage::RoutePolicy => STAGE_ROUTE_POLICY,
            V1Stage::ExportPodCIDR => STAGE_EXPORT_POD_CIDR,
            V1Stage::LBService => STAGE_LB_SERVICE,
            V1Stage::PodIPPool => STAGE_POD_IP_POOL,
        }
    }

    fn depends_on(&self) -> &'static [&'static str] {
        match self {
            V1Stage::Preflight => &[],
            V1Stage::Neighbor => &[STAGE_PREFLIGHT],
            V1Stage::RoutePolicy => &[STAGE_PREFLIGHT, STAGE_NEIGHBOR],
            V1Stage::ExportPodCIDR | V1Stage::LBService | V1Stage::PodIPPool => {
                &[STAGE_PREFLIGHT, STAGE_ROUTE_POLICY]
            }
        }
    }

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext,
        input: &V1Input,
        state: &mut InstanceState,
    ) -> StageResult {
        match self {
            V1Stage::Preflight => preflight::reconcile(input, state).await,
            V1Stage::Neighbor => neighbor::reconcile(input, state).await,
            V1Stage::RoutePolicy => route_policy::reconcile(input, state).await,
            V1Stage::ExportPodCIDR => pod_cidr::reconcile(input, state).await,
            V1Stage::LBService => lb_service::reconcile(input, state).await,
            V1Stage::PodIPPool => pod_ip_pool::reconcile(input, state).await,
        }
    }
}

/// The service diffs of a pass are gone once drained, so anything short of
/// a clean LBService run forces a full resync next time.
pub fn after_pass(reports: &[StageReport], state: &mut InstanceState) {
    let clean = reports.iter().any(|r| {
        r.stage == STAGE_LB_SERVICE && matches!(&r.status, StageStatus::Succeeded(errs) if errs.is_empty())
    });
    if !clean {
        state.service_synced = false;
    }
}
