use clap::{Parser, Subcommand, ValueEnum};

use bgpcp_kubernetes::agent::{
    self,
    config::{Config, IpamMode},
    error::Error,
};
use bgpcp_trace::init::TraceConfig;

use crate::agent::AgentCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Agent(AgentCmd),
    Version,
}

/// Flags given on the command line win over the config file.
pub fn agent_config(a: AgentCmd) -> Result<Config, Error> {
    let mut config = match a.file {
        None => Config::default(),
        Some(file) => Config::load(&file)?,
    };
    if let Some(node_name) = a.node_name {
        config.node_name = Some(node_name);
    }
    if let Some(enabled) = a.enabled {
        config.enabled = enabled;
    }
    if let Some(ns) = a.secrets_namespace {
        config.secrets_namespace = ns;
    }
    if let Some(mode) = a.ipam_mode {
        config.ipam_mode = mode.parse::<IpamMode>()?;
    }
    if let Some(port) = a.http_port {
        config.http_port = port;
    }
    Ok(config)
}

pub fn run() -> Result<(), Error> {
    let command = Cmd::parse();

    match command.sub {
        SubCmd::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        SubCmd::Agent(a) => {
            let trace_conf = TraceConfig {
                level: command.level,
                format: command.format.to_string(),
                file: command.log_file,
            };
            let config = agent_config(a)?;
            agent::start(config, trace_conf)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest(
        args,
        enabled,
        secrets_namespace,
        ipam_mode,
        case(vec!["bgpcpd", "agent"], true, "kube-system", IpamMode::ClusterPool),
        case(
            vec!["bgpcpd", "agent", "--enable-bgp-control-plane", "false", "--bgp-secrets-namespace", ""],
            false,
            "",
            IpamMode::ClusterPool
        ),
        case(vec!["bgpcpd", "-l", "debug", "agent", "--ipam", "multi-pool"], true, "kube-system", IpamMode::MultiPool)
    )]
    fn test_agent_config(args: Vec<&str>, enabled: bool, secrets_namespace: &str, ipam_mode: IpamMode) {
        let cmd = Cmd::try_parse_from(args).unwrap();
        let a = match cmd.sub {
            SubCmd::Agent(a) => a,
            SubCmd::Version => panic!("expected agent"),
        };
        let config = agent_config(a).unwrap();
        assert_eq!(enabled, config.enabled);
        assert_eq!(secrets_namespace, config.secrets_namespace);
        assert_eq!(ipam_mode, config.ipam_mode);
    }

    #[test]
    fn test_invalid_ipam_mode() {
        let cmd = Cmd::try_parse_from(["bgpcpd", "agent", "--ipam", "eni"]).unwrap();
        let a = match cmd.sub {
            SubCmd::Agent(a) => a,
            SubCmd::Version => panic!("expected agent"),
        };
        assert!(agent_config(a).is_err());
    }
}
