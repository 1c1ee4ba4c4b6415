use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_RECONCILE_ERROR: &str = "cilium.io/BGPReconcileError";
/// Peering state of a peer whose references cannot be resolved.
pub const PEER_STATE_NOT_READY: &str = "not-ready";

/// Per-node BGP configuration. The object is named after the node.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2", kind = "CiliumBGPNodeConfig")]
#[kube(status = "CiliumBGPNodeConfigStatus")]
#[kube(shortname = "bgpnode")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodeConfigSpec {
    pub bgp_instances: Vec<CiliumBGPNodeInstance>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodeInstance {
    pub name: String,
    #[serde(rename = "localASN")]
    pub local_asn: Option<i64>,
    #[serde(rename = "routerID")]
    pub router_id: Option<String>,
    pub local_port: Option<i32>,
    pub peers: Option<Vec<CiliumBGPNodePeer>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodePeer {
    pub name: String,
    pub peer_address: Option<String>,
    #[serde(rename = "peerASN")]
    pub peer_asn: Option<i64>,
    pub peer_config_ref: Option<PeerConfigReference>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfigReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodeConfigStatus {
    pub bgp_instances: Vec<CiliumBGPNodeInstanceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodeInstanceStatus {
    pub name: String,
    #[serde(rename = "localASN")]
    pub local_asn: Option<i64>,
    pub peers: Vec<CiliumBGPNodePeerStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPNodePeerStatus {
    pub name: String,
    pub peer_address: String,
    #[serde(rename = "peerASN")]
    pub peer_asn: Option<i64>,
    pub peering_state: Option<String>,
    pub timers: Option<CiliumBGPTimersState>,
    pub route_count: Vec<BGPFamilyRouteCount>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPTimersState {
    pub applied_hold_time_seconds: Option<i32>,
    pub applied_keepalive_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPFamilyRouteCount {
    pub afi: String,
    pub safi: String,
    pub received: Option<i32>,
    pub advertised: Option<i32>,
}
