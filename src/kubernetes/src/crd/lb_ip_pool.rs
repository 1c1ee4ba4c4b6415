use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2", kind = "CiliumLoadBalancerIPPool")]
#[kube(shortname = "ippools")]
#[kube(
    printcolumn = r#"{"name":"DISABLED", "type":"boolean", "description":"Whether the pool is disabled", "jsonPath":".spec.disabled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumLoadBalancerIPPoolSpec {
    pub blocks: Vec<CiliumLoadBalancerIPPoolIPBlock>,
    #[serde(default)]
    pub disabled: bool,
    pub service_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiliumLoadBalancerIPPoolIPBlock {
    pub cidr: String,
}

impl CiliumLoadBalancerIPPool {
    pub fn cidrs(&self) -> Vec<ipnet::IpNet> {
        self.spec
            .blocks
            .iter()
            .filter_map(|b| b.cidr.parse::<ipnet::IpNet>().ok())
            .map(|c| c.trunc())
            .collect()
    }
}
