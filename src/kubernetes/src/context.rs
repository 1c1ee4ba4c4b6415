use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use bgpcp_trace::metrics::Metrics;

use crate::{agent::controller::ControllerState, mode::ConfigMode};

/// State shared between the controller and the web server.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub registry: prometheus::Registry,
}

impl State {
    pub fn new(component: &str) -> State {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(component.to_string()))),
            registry: prometheus::Registry::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Register a fresh set of metrics on the registry of this state.
    pub fn to_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::default().register(&self.registry)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub component: String,
    pub last_event: DateTime<Utc>,
    pub state: ControllerState,
    pub mode: ConfigMode,
    pub passes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Diagnostics {
    pub fn new(component: String) -> Self {
        Self {
            component,
            last_event: Utc::now(),
            state: ControllerState::default(),
            mode: ConfigMode::default(),
            passes: 0,
            trace_id: None,
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new("bgpcp-agent".to_string())
    }
}
