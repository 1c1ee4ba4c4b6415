use kube::CustomResourceExt;
use bgpcp_kubernetes::crd;

fn main() -> anyhow::Result<()> {
    let crds = [
        crd::peering_policy::CiliumBGPPeeringPolicy::crd(),
        crd::node_config::CiliumBGPNodeConfig::crd(),
        crd::peer_config::CiliumBGPPeerConfig::crd(),
        crd::advertisement::CiliumBGPAdvertisement::crd(),
        crd::lb_ip_pool::CiliumLoadBalancerIPPool::crd(),
        crd::pod_ip_pool::CiliumPodIPPool::crd(),
    ];
    for (i, c) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(c)?);
    }
    Ok(())
}
