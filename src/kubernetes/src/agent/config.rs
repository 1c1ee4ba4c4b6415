use std::{fs, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::tables::DEFAULT_ERROR_TABLE_CAPACITY;

use super::error::{ConfigError, Error};

pub const DEFAULT_HTTP_PORT: u32 = 9890;
pub const DEFAULT_PASS_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 2;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;
pub const ENV_NODE_NAME: &str = "NODE_NAME";
pub const ENV_HOSTNAME: &str = "HOSTNAME";

/// How pod addresses are managed in the cluster. Pod IP pools only exist
/// in `multi-pool` mode.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IpamMode {
    #[default]
    ClusterPool,
    Kubernetes,
    MultiPool,
}

impl std::fmt::Display for IpamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClusterPool => write!(f, "cluster-pool"),
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::MultiPool => write!(f, "multi-pool"),
        }
    }
}

impl FromStr for IpamMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster-pool" => Ok(IpamMode::ClusterPool),
            "kubernetes" => Ok(IpamMode::Kubernetes),
            "multi-pool" => Ok(IpamMode::MultiPool),
            _ => Err(ConfigError::InvalidArgument(format!("unknown IPAM mode {s}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub enabled: bool,
    pub node_name: Option<String>,
    /// Namespace holding peer authentication secrets. Empty disables
    /// authentication.
    pub secrets_namespace: String,
    pub ipam_mode: IpamMode,
    pub http_port: u32,
    pub pass_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub error_table_capacity: usize,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(ConfigError::FailedToLoad(e.to_string())))
    }

    /// Node name from the file, then `NODE_NAME`, then `HOSTNAME`.
    pub fn resolve_node_name(&self) -> Result<String, Error> {
        self.node_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| std::env::var(ENV_NODE_NAME).ok().filter(|n| !n.is_empty()))
            .or_else(|| std::env::var(ENV_HOSTNAME).ok().filter(|n| !n.is_empty()))
            .ok_or(Error::MissingNodeName)
    }

    pub fn secrets_namespace(&self) -> Option<&str> {
        Some(self.secrets_namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    pub fn pod_ip_pools_enabled(&self) -> bool {
        self.ipam_mode == IpamMode::MultiPool
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn backoff(&self) -> (Duration, Duration) {
        let min = Duration::from_secs(self.backoff_min_secs.max(1));
        (min, Duration::from_secs(self.backoff_max_secs).max(min))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pass_timeout_secs == 0 || self.stage_timeout_secs == 0 {
            return Err(ConfigError::InvalidArgument(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.error_table_capacity == 0 {
            return Err(ConfigError::InvalidArgument(
                "error table capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            node_name: None,
            secrets_namespace: "kube-system".to_string(),
            ipam_mode: IpamMode::default(),
            http_port: DEFAULT_HTTP_PORT,
            pass_timeout_secs: DEFAULT_PASS_TIMEOUT_SECS,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            error_table_capacity: DEFAULT_ERROR_TABLE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
enabled: false
secretsNamespace: ""
ipamMode: multi-pool
passTimeoutSecs: 10
"#,
        )
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(None, config.secrets_namespace());
        assert!(config.pod_ip_pools_enabled());
        assert_eq!(Duration::from_secs(10), config.pass_timeout());
        assert_eq!(Duration::from_secs(5), config.stage_timeout());
        assert_eq!(DEFAULT_HTTP_PORT, config.http_port);
    }

    #[rstest(
        input,
        expected,
        case("cluster-pool", Some(IpamMode::ClusterPool)),
        case("kubernetes", Some(IpamMode::Kubernetes)),
        case("multi-pool", Some(IpamMode::MultiPool)),
        case("eni", None)
    )]
    fn test_parse_ipam_mode(input: &str, expected: Option<IpamMode>) {
        assert_eq!(expected, IpamMode::from_str(input).ok());
    }

    #[test]
    fn test_explicit_node_name_wins() {
        let config = Config {
            node_name: Some("node1".to_string()),
            ..Default::default()
        };
        assert_eq!("node1", config.resolve_node_name().unwrap());
    }

    #[rstest(
        pass,
        capacity,
        valid,
        case(30, 1024, true),
        case(0, 1024, false),
        case(30, 0, false)
    )]
    fn test_validate(pass: u64, capacity: usize, valid: bool) {
        let config = Config {
            pass_timeout_secs: pass,
            error_table_capacity: capacity,
            ..Default::default()
        };
        assert_eq!(valid, config.validate().is_ok());
    }

    #[test]
    fn test_backoff_bounds() {
        let config = Config {
            backoff_min_secs: 0,
            backoff_max_secs: 0,
            ..Default::default()
        };
        assert_eq!((Duration::from_secs(1), Duration::from_secs(1)), config.backoff());
    }
}
