use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2alpha1", kind = "CiliumPodIPPool")]
#[kube(shortname = "cpip")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumPodIPPoolSpec {
    pub ipv4: Option<IPv4PoolSpec>,
    pub ipv6: Option<IPv6PoolSpec>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IPv4PoolSpec {
    pub cidrs: Vec<String>,
    pub mask_size: u8,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IPv6PoolSpec {
    pub cidrs: Vec<String>,
    pub mask_size: u8,
}

impl CiliumPodIPPool {
    pub fn cidrs(&self) -> Vec<ipnet::IpNet> {
        let v4 = self.spec.ipv4.iter().flat_map(|p| p.cidrs.iter());
        let v6 = self.spec.ipv6.iter().flat_map(|p| p.cidrs.iter());
        v4.chain(v6)
            .filter_map(|c| c.parse::<ipnet::IpNet>().ok())
            .map(|c| c.trunc())
            .collect()
    }
}
