use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::{
    advertisement::BGPCommunities,
    peer_config::{CiliumBGPFamily, CiliumBGPNeighborGracefulRestart},
};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2alpha1", kind = "CiliumBGPPeeringPolicy")]
#[kube(shortname = "bgpp")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPPeeringPolicySpec {
    /// Nodes this policy applies to. Unset selects every node.
    pub node_selector: Option<LabelSelector>,
    pub virtual_routers: Vec<CiliumBGPVirtualRouter>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPVirtualRouter {
    #[serde(rename = "localASN")]
    pub local_asn: i64,
    pub export_pod_cidr: Option<bool>,
    #[serde(rename = "podIPPoolSelector")]
    pub pod_ip_pool_selector: Option<LabelSelector>,
    pub service_selector: Option<LabelSelector>,
    pub neighbors: Vec<CiliumBGPNeighbor>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNeighbor {
    pub peer_address: String,
    pub peer_port: Option<i32>,
    #[serde(rename = "peerASN")]
    pub peer_asn: i64,
    pub auth_secret_ref: Option<String>,
    #[serde(rename = "eBGPMultihopTTL")]
    pub ebgp_multihop_ttl: Option<i32>,
    pub connect_retry_time_seconds: Option<i32>,
    pub hold_time_seconds: Option<i32>,
    pub keep_alive_time_seconds: Option<i32>,
    pub graceful_restart: Option<CiliumBGPNeighborGracefulRestart>,
    pub families: Option<Vec<CiliumBGPFamily>>,
    pub advertised_path_attributes: Option<Vec<CiliumBGPPathAttributes>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPPathAttributes {
    pub selector_type: PathAttributesSelectorType,
    pub selector: Option<LabelSelector>,
    pub communities: Option<BGPCommunities>,
    pub local_preference: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
pub enum PathAttributesSelectorType {
    #[default]
    PodCIDR,
    CiliumLoadBalancerIPPool,
    CiliumPodIPPool,
}
