pub mod common;
pub mod context;
pub mod snapshot;
pub mod v1;
pub mod v2;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bgpcp_bgp::speaker::GlobalConfig;
use bgpcp_trace::error::TraceableError;
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Serialize;
use thiserror::Error;

use crate::store::ObjectKey;

pub use context::ReconcileContext;

pub const KIND_PEERING_POLICY: &str = "PeeringPolicy";
pub const KIND_NODE_CONFIG: &str = "NodeConfig";
pub const KIND_PEER_CONFIG: &str = "PeerConfig";
pub const KIND_ADVERTISEMENT: &str = "Advertisement";
pub const KIND_PEER: &str = "Peer";
pub const KIND_SECRET: &str = "Secret";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_NODE: &str = "Node";
pub const KIND_POD_IP_POOL: &str = "PodIPPool";
pub const KIND_ROUTER: &str = "Router";
pub const KIND_STAGE: &str = "Stage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Desired state cannot be computed from the current input.
    ConfigInvalid,
    /// Speaker or network failure, retried with backoff.
    Transient,
    /// The router cannot be brought up.
    Fatal,
    /// One resource failed while the others were applied.
    Partial,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::ConfigInvalid => write!(f, "config_invalid"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Partial => write!(f, "partial"),
        }
    }
}

/// Error tagged with the resource it originates from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} {name}: {message}")]
pub struct ResourceError {
    pub class: ErrorClass,
    pub kind: &'static str,
    pub name: String,
    pub message: String,
}

impl ResourceError {
    pub fn new(class: ErrorClass, kind: &'static str, name: &str, message: impl ToString) -> Self {
        ResourceError {
            class,
            kind,
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn config_invalid(kind: &'static str, name: &str, message: impl ToString) -> Self {
        Self::new(ErrorClass::ConfigInvalid, kind, name, message)
    }

    pub fn transient(kind: &'static str, name: &str, message: impl ToString) -> Self {
        Self::new(ErrorClass::Transient, kind, name, message)
    }

    /// Classify an error returned by the router manager.
    pub fn from_bgp(kind: &'static str, name: &str, e: &bgpcp_bgp::error::Error) -> Self {
        let class = if e.is_fatal() {
            ErrorClass::Fatal
        } else {
            ErrorClass::Transient
        };
        Self::new(class, kind, name, e)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class, ErrorClass::Transient | ErrorClass::Partial)
    }
}

impl TraceableError for ResourceError {
    fn metric_label(&self) -> String {
        format!("{}_{}", self.class, self.kind.to_lowercase())
    }
}

pub type StageResult = Result<Vec<ResourceError>, ResourceError>;

/// What a pipeline remembers about one instance between passes.
#[derive(Debug, Clone, Default)]
pub struct InstanceState {
    pub global: Option<GlobalConfig>,
    /// Prefixes advertised by each stage.
    pub owned_paths: BTreeMap<&'static str, BTreeSet<IpNet>>,
    /// Prefixes advertised per service by the incremental service stage.
    pub service_paths: BTreeMap<ObjectKey, BTreeSet<IpNet>>,
    pub service_selector: Option<Option<LabelSelector>>,
    /// Set once a full service reconciliation completed.
    pub service_synced: bool,
    /// Peers whose PeerConfig or auth secret could not be resolved.
    pub not_ready_peers: BTreeSet<String>,
}

impl InstanceState {
    /// Forget everything tied to the running router.
    pub fn reset_router(&mut self) {
        self.owned_paths.clear();
        self.service_paths.clear();
        self.service_synced = false;
    }

    pub fn advertised(&self) -> BTreeSet<IpNet> {
        self.owned_paths.values().flatten().cloned().collect()
    }
}

/// A single step of a reconcile pipeline.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Input: Send + Sync;

    fn name(&self) -> &'static str;

    /// Stages that must have succeeded in this pass before this one runs.
    fn depends_on(&self) -> &'static [&'static str];

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        input: &Self::Input,
        state: &mut InstanceState,
    ) -> StageResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Ran to completion, possibly with errors on individual resources.
    Succeeded(Vec<ResourceError>),
    Failed(ResourceError),
    /// A dependency did not succeed.
    Skipped,
    TimedOut,
    /// The pass deadline expired before the stage started.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: &'static str,
    pub status: StageStatus,
}

impl StageReport {
    pub fn ran(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Succeeded(_) | StageStatus::Failed(_) | StageStatus::TimedOut
        )
    }

    pub fn errors(&self) -> Vec<ResourceError> {
        match &self.status {
            StageStatus::Succeeded(errs) => errs.clone(),
            StageStatus::Failed(e) => vec![e.clone()],
            StageStatus::TimedOut => vec![ResourceError::transient(
                KIND_STAGE,
                self.stage,
                "stage timed out",
            )],
            _ => Vec::new(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(&self.status, StageStatus::Failed(e) if e.class == ErrorClass::Fatal)
    }

    /// Whether the stage wants another attempt with backoff.
    pub fn needs_retry(&self) -> bool {
        match &self.status {
            StageStatus::Succeeded(errs) => errs.iter().any(|e| e.is_retryable()),
            StageStatus::Failed(e) => e.is_retryable(),
            StageStatus::TimedOut | StageStatus::NotRun => true,
            StageStatus::Skipped => false,
        }
    }
}

/// Run `stages` in order. A stage runs only if all of its dependencies
/// succeeded earlier in this pass; independent stages run regardless of
/// failures elsewhere.
pub async fn run_pipeline<R: Reconciler>(
    stages: &[R],
    ctx: &ReconcileContext,
    input: &R::Input,
    state: &mut InstanceState,
) -> Vec<StageReport> {
    let mut failed: BTreeSet<&'static str> = BTreeSet::new();
    let mut reports = Vec::with_capacity(stages.len());

    for stage in stages.iter() {
        let name = stage.name();
        let status = if ctx.pass_expired() {
            StageStatus::NotRun
        } else if stage.depends_on().iter().any(|d| failed.contains(d)) {
            StageStatus::Skipped
        } else {
            match tokio::time::timeout_at(
                ctx.stage_deadline(),
                stage.reconcile(ctx, input, state),
            )
            .await
            {
                Ok(Ok(errs)) => StageStatus::Succeeded(errs),
                Ok(Err(e)) => StageStatus::Failed(e),
                Err(_) => StageStatus::TimedOut,
            }
        };
        match &status {
            StageStatus::Succeeded(errs) if !errs.is_empty() => {
                tracing::warn!(stage = name, errors = errs.len(), "stage completed with errors")
            }
            StageStatus::Succeeded(_) => tracing::debug!(stage = name, "stage completed"),
            StageStatus::Failed(e) => {
                tracing::warn!(stage = name, error = %e, "stage failed")
            }
            other => tracing::warn!(stage = name, status = ?other, "stage did not complete"),
        }
        if !matches!(status, StageStatus::Succeeded(_)) {
            failed.insert(name);
        }
        reports.push(StageReport {
            stage: name,
            status,
        });
    }
    reports
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Clone, Copy)]
    enum TestStage {
        Ok(&'static str, &'static [&'static str]),
        Fail(&'static str, &'static [&'static str]),
        Slow(&'static str),
    }

    #[async_trait]
    impl Reconciler for TestStage {
        type Input = ();

        fn name(&self) -> &'static str {
            match self {
                TestStage::Ok(n, _) | TestStage::Fail(n, _) | TestStage::Slow(n) => n,
            }
        }

        fn depends_on(&self) -> &'static [&'static str] {
            match self {
                TestStage::Ok(_, d) | TestStage::Fail(_, d) => d,
                TestStage::Slow(_) => &[],
            }
        }

        async fn reconcile(
            &self,
            _ctx: &ReconcileContext,
            _input: &(),
            _state: &mut InstanceState,
        ) -> StageResult {
            match self {
                TestStage::Ok(..) => Ok(vec![]),
                TestStage::Fail(n, _) => Err(ResourceError::transient(KIND_STAGE, n, "boom")),
                TestStage::Slow(_) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![])
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_stages_short_circuit() {
        let stages = [
            TestStage::Ok("preflight", &[]),
            TestStage::Fail("neighbor", &["preflight"]),
            TestStage::Ok("policy", &["preflight", "neighbor"]),
            TestStage::Ok("podcidr", &["preflight"]),
            TestStage::Slow("slow"),
            TestStage::Ok("after", &["slow"]),
        ];
        let ctx = ReconcileContext::new(Duration::from_secs(30), Duration::from_secs(5));
        let mut state = InstanceState::default();
        let reports = run_pipeline(&stages, &ctx, &(), &mut state).await;
        let statuses: Vec<(&str, bool, bool)> = reports
            .iter()
            .map(|r| (r.stage, r.ran(), r.needs_retry()))
            .collect();
        assert_eq!(
            vec![
                ("preflight", true, false),
                ("neighbor", true, true),
                ("policy", false, false),
                ("podcidr", true, false),
                ("slow", true, true),
                ("after", false, false),
            ],
            statuses
        );
        assert_eq!(StageStatus::TimedOut, reports[4].status);
        assert_eq!(StageStatus::Skipped, reports[5].status);
    }

    #[tokio::test]
    async fn test_expired_pass_runs_nothing() {
        let stages = [TestStage::Ok("preflight", &[])];
        let ctx = ReconcileContext::new(Duration::from_secs(0), Duration::from_secs(5));
        let mut state = InstanceState::default();
        let reports = run_pipeline(&stages, &ctx, &(), &mut state).await;
        assert_eq!(StageStatus::NotRun, reports[0].status);
    }

    #[test]
    fn test_metric_label() {
        let e = ResourceError::config_invalid(KIND_PEER_CONFIG, "x", "secret not found");
        assert_eq!("config_invalid_peerconfig", e.metric_label());
        assert_eq!("PeerConfig x: secret not found", e.to_string());
    }
}
