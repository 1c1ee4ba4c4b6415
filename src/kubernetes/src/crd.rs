pub mod advertisement;
pub mod error;
pub mod lb_ip_pool;
pub mod node_config;
pub mod peer_config;
pub mod peering_policy;
pub mod pod_ip_pool;

pub const CILIUM_GROUP: &str = "cilium.io";
