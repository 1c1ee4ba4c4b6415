use bgpcp_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("node name is not set, configure nodeName or set NODE_NAME or HOSTNAME")]
    MissingNodeName,

    #[error("Metrics Error: {0}")]
    Metrics(#[source] prometheus::Error),

    #[error("Trace Error: {0}")]
    Trace(#[source] bgpcp_trace::init::Error),

    #[error("signaler events were already taken")]
    EventsTaken,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load: {0}")]
    FailedToLoad(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::StdIo(_) => "io",
            Error::Kube(_) => "kube",
            Error::Config(_) => "config",
            Error::MissingNodeName => "missing_node_name",
            Error::Metrics(_) => "metrics",
            Error::Trace(_) => "trace",
            Error::EventsTaken => "events_taken",
        }
        .to_string()
    }
}
