use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct AgentCmd {
    #[arg(short = 'f', long, help = "Config file path for Agent daemon")]
    pub file: Option<String>,

    #[arg(
        long = "node-name",
        help = "Name of the node this agent runs on (defaults to NODE_NAME, then HOSTNAME)"
    )]
    pub node_name: Option<String>,

    #[arg(
        long = "enable-bgp-control-plane",
        help = "Enable or disable the BGP Control Plane"
    )]
    pub enabled: Option<bool>,

    #[arg(
        long = "bgp-secrets-namespace",
        help = "Namespace holding BGP peer authentication secrets, empty disables authentication"
    )]
    pub secrets_namespace: Option<String>,

    #[arg(
        long = "ipam",
        help = "IPAM mode (cluster-pool, kubernetes, multi-pool)"
    )]
    pub ipam_mode: Option<String>,

    #[arg(long = "http-port", help = "Port serving the read API and probes")]
    pub http_port: Option<u32>,
}
