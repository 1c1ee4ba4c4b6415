use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use bgpcp_bgp::{manager::RouterManager, peer::SessionState};
use bgpcp_trace::{
    metrics::{Metrics, RESULT_ERROR, RESULT_FAILED, RESULT_SUCCESS, RESULT_TIMEOUT},
    telemetry::get_trace_id,
};
use chrono::Utc;
use futures::StreamExt;
use kube::ResourceExt;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{field, Span};

use crate::{
    context::Diagnostics,
    crd::{node_config::CiliumBGPNodeConfig, peering_policy::CiliumBGPPeeringPolicy},
    mode::{ConfigMode, Mode},
    reconciler::{
        common::{teardown, validate_asn},
        run_pipeline,
        snapshot::{Snapshot, Stores},
        v1::{self, V1Input, V1Stage},
        v2::{
            self,
            state::{NodeConfigStatusWriter, StatusReconciler},
            V2Input, V2Stage,
        },
        ErrorClass, InstanceState, ReconcileContext, ResourceError, StageReport, StageStatus,
        KIND_NODE_CONFIG, KIND_PEERING_POLICY,
    },
    selector::{self, Unset},
    signaler::Signaler,
    tables::{ErrorKey, ReconcileErrorTable},
};

use super::config::Config;

/// Instance name of rows raised by the controller itself.
pub const CONTROLLER_INSTANCE: &str = "bgp-control-plane";
pub const STAGE_MODE_SELECTION: &str = "ModeSelection";
pub const STAGE_TEARDOWN: &str = "Teardown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    #[default]
    Disabled,
    WaitingForSync,
    Reconciling,
    Idle,
    Failed,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Disabled => write!(f, "disabled"),
            ControllerState::WaitingForSync => write!(f, "waiting-for-sync"),
            ControllerState::Reconciling => write!(f, "reconciling"),
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Failed => write!(f, "failed"),
        }
    }
}

/// Read handle on the controller state.
#[derive(Debug, Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<ControllerState>>,
}

impl StateHandle {
    pub fn get(&self) -> ControllerState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: ControllerState) -> ControllerState {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, state)
    }
}

/// Exponential retry delay per (instance, stage).
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    delays: BTreeMap<(String, String), Duration>,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max,
            delays: BTreeMap::new(),
        }
    }

    fn failed(&mut self, instance: &str, stage: &str) -> Duration {
        let key = (instance.to_string(), stage.to_string());
        let next = match self.delays.get(&key) {
            Some(d) => (*d * 2).min(self.max),
            None => self.min,
        };
        self.delays.insert(key, next);
        next
    }

    fn succeeded(&mut self, instance: &str, stage: &str) {
        self.delays.remove(&(instance.to_string(), stage.to_string()));
    }

    fn forget(&mut self, instance: &str) {
        self.delays.retain(|(i, _), _| i != instance);
    }
}

/// Everything the controller is wired to.
pub struct Components {
    pub stores: Stores,
    pub signaler: Signaler,
    pub mode: Mode,
    pub manager: Arc<dyn RouterManager>,
    pub errors: Arc<ReconcileErrorTable>,
    pub status_writer: Arc<dyn NodeConfigStatusWriter>,
    pub metrics: Metrics,
    pub diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub state: ControllerState,
    pub mode: ConfigMode,
    pub instances: BTreeMap<String, Vec<StageReport>>,
}

impl PassReport {
    fn with_state(state: ControllerState, mode: ConfigMode) -> Self {
        PassReport {
            state,
            mode,
            instances: BTreeMap::new(),
        }
    }
}

enum Selection {
    Disabled,
    V1(Arc<CiliumBGPPeeringPolicy>),
    /// Several policies select the node, nothing is applied.
    V1Ambiguous,
    V2(Arc<CiliumBGPNodeConfig>),
}

impl Selection {
    fn mode(&self) -> ConfigMode {
        match self {
            Selection::Disabled => ConfigMode::Disabled,
            Selection::V1(_) | Selection::V1Ambiguous => ConfigMode::BGPv1,
            Selection::V2(_) => ConfigMode::BGPv2,
        }
    }
}

/// Single worker driving every reconcile pass of this node.
pub struct Controller {
    node_name: String,
    enabled: bool,
    pass_timeout: Duration,
    stage_timeout: Duration,
    stores: Stores,
    signaler: Signaler,
    mode: Mode,
    manager: Arc<dyn RouterManager>,
    errors: Arc<ReconcileErrorTable>,
    status: StatusReconciler,
    metrics: Metrics,
    diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
    state: StateHandle,
    v1: BTreeMap<String, InstanceState>,
    v2: BTreeMap<String, InstanceState>,
    backoff: Backoff,
    retry: Option<(Instant, JoinHandle<()>)>,
    failed_generation: Option<u64>,
    passes: u64,
    token: CancellationToken,
}

impl Controller {
    pub fn new(config: &Config, node_name: &str, components: Components, token: CancellationToken) -> Self {
        let (min, max) = config.backoff();
        let state = StateHandle::default();
        state.set(if config.enabled {
            ControllerState::WaitingForSync
        } else {
            ControllerState::Disabled
        });
        Controller {
            node_name: node_name.to_string(),
            enabled: config.enabled,
            pass_timeout: config.pass_timeout(),
            stage_timeout: config.stage_timeout(),
            stores: components.stores,
            signaler: components.signaler,
            mode: components.mode,
            manager: components.manager,
            errors: components.errors,
            status: StatusReconciler::new(components.status_writer),
            metrics: components.metrics,
            diagnostics: components.diagnostics,
            state,
            v1: BTreeMap::new(),
            v2: BTreeMap::new(),
            backoff: Backoff::new(min, max),
            retry: None,
            failed_generation: None,
            passes: 0,
            token,
        }
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    fn set_state(&self, next: ControllerState) {
        let prev = self.state.set(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "controller state changed");
        }
    }

    /// Consume signaler wakeups until cancelled, then tear every router down.
    #[tracing::instrument(skip_all, fields(node = %self.node_name))]
    pub async fn run(mut self) -> Result<(), super::error::Error> {
        if !self.enabled {
            self.set_state(ControllerState::Disabled);
            tracing::info!("BGP Control Plane is disabled");
            self.token.cancelled().await;
            return Ok(());
        }
        let mut events = self
            .signaler
            .events()
            .ok_or(super::error::Error::EventsTaken)?;
        self.set_state(ControllerState::WaitingForSync);
        tracing::info!("start BGP Control Plane controller");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.next() => match event {
                    Some(()) => {
                        self.reconcile_once().await;
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Run one pass over a snapshot of the stores.
    #[tracing::instrument(skip_all, fields(trace_id))]
    pub async fn reconcile_once(&mut self) -> PassReport {
        let trace_id = get_trace_id();
        Span::current().record("trace_id", &field::display(&trace_id));

        if !self.enabled {
            return PassReport::with_state(ControllerState::Disabled, ConfigMode::Disabled);
        }
        if !self.stores.synced() {
            self.set_state(ControllerState::WaitingForSync);
            tracing::debug!("stores are not synced yet");
            return PassReport::with_state(ControllerState::WaitingForSync, self.mode.get());
        }
        let generation = self.stores.generation();
        if self.state.get() == ControllerState::Failed && self.failed_generation == Some(generation) {
            tracing::debug!("configuration unchanged since the fatal error, skipping");
            return PassReport::with_state(ControllerState::Failed, self.mode.get());
        }
        self.failed_generation = None;
        self.set_state(ControllerState::Reconciling);
        let _measure = self.metrics.measure();

        let snapshot = Arc::new(self.stores.snapshot(&self.node_name));
        let ctx = ReconcileContext::new(self.pass_timeout, self.stage_timeout);

        let mut controller_rows = Vec::new();
        let selection = select(&snapshot, &mut controller_rows);
        let mode = selection.mode();
        let prev = self.mode.set(mode);
        if prev != mode {
            tracing::info!(from = %prev, to = %mode, "config mode changed");
            match prev {
                ConfigMode::BGPv1 => self.teardown_all_v1(&mut controller_rows).await,
                ConfigMode::BGPv2 => {
                    self.teardown_all_v2(&mut controller_rows).await;
                    self.status.reset();
                }
                ConfigMode::Disabled => {}
            }
        }

        let mut instances = BTreeMap::new();
        match &selection {
            Selection::V1(policy) => {
                self.reconcile_v1(&ctx, &snapshot, policy, &mut instances, &mut controller_rows)
                    .await
            }
            Selection::V2(config) => {
                self.reconcile_v2(&ctx, &snapshot, config, &mut instances, &mut controller_rows)
                    .await
            }
            Selection::V1Ambiguous | Selection::Disabled => {}
        }
        // The service diffs of this pass are drained, instances that did not
        // consume them have to resync in full.
        for (name, state) in self.v1.iter_mut() {
            if !instances.contains_key(name) {
                state.service_synced = false;
            }
        }

        for (instance, reports) in instances.iter() {
            self.record(instance, reports);
        }

        if let Selection::V2(config) = &selection {
            let names: BTreeSet<&str> = config
                .spec
                .bgp_instances
                .iter()
                .map(|i| i.name.as_str())
                .collect();
            let rows: Vec<_> = self
                .errors
                .list()
                .into_iter()
                .filter(|r| names.contains(r.instance.as_str()))
                .collect();
            let not_ready: BTreeMap<String, BTreeSet<String>> = self
                .v2
                .iter()
                .map(|(name, state)| (name.clone(), state.not_ready_peers.clone()))
                .collect();
            match self
                .status
                .reconcile(self.manager.as_ref(), config, &rows, &not_ready, Utc::now())
                .await
            {
                Ok(_) => self.backoff.succeeded(CONTROLLER_INSTANCE, v2::STAGE_STATUS),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to update node config status");
                    let delay = self.backoff.failed(CONTROLLER_INSTANCE, v2::STAGE_STATUS);
                    self.schedule_retry(delay);
                    controller_rows.push((v2::STAGE_STATUS, e));
                }
            }
        }
        self.record_controller_rows(&controller_rows);

        let fatal = instances.values().flatten().any(|r| r.is_fatal());
        let incomplete = instances
            .values()
            .flatten()
            .any(|r| matches!(r.status, StageStatus::TimedOut | StageStatus::NotRun));
        let has_errors = !controller_rows.is_empty()
            || instances.values().flatten().any(|r| !r.errors().is_empty());

        self.schedule_backoff(&instances);
        if instances
            .values()
            .flatten()
            .any(|r| r.status == StageStatus::NotRun)
        {
            // The pass ran out of time, go again right away.
            self.signaler.event();
        }

        let state = if fatal {
            self.failed_generation = Some(generation);
            self.metrics.reconcile_run(RESULT_FAILED);
            tracing::error!("router could not be initialized, waiting for a configuration change");
            ControllerState::Failed
        } else {
            self.metrics.reconcile_run(if incomplete {
                RESULT_TIMEOUT
            } else if has_errors {
                RESULT_ERROR
            } else {
                RESULT_SUCCESS
            });
            ControllerState::Idle
        };
        self.set_state(state);
        self.update_metrics().await;
        self.passes += 1;
        {
            let mut diagnostics = self.diagnostics.write().await;
            diagnostics.last_event = Utc::now();
            diagnostics.state = state;
            diagnostics.mode = mode;
            diagnostics.passes = self.passes;
            diagnostics.trace_id = Some(trace_id.to_string());
        }

        PassReport {
            state,
            mode,
            instances,
        }
    }

    async fn reconcile_v1(
        &mut self,
        ctx: &ReconcileContext,
        snapshot: &Arc<Snapshot>,
        policy: &CiliumBGPPeeringPolicy,
        instances: &mut BTreeMap<String, Vec<StageReport>>,
        controller_rows: &mut Vec<(&'static str, ResourceError)>,
    ) {
        let policy_name = policy.name_any();
        let mut desired = BTreeMap::new();
        for router in policy.spec.virtual_routers.iter() {
            let name = v1::instance_name(router.local_asn);
            if desired.insert(name.clone(), router.clone()).is_some() {
                controller_rows.push((
                    STAGE_MODE_SELECTION,
                    ResourceError::config_invalid(
                        KIND_PEERING_POLICY,
                        &policy_name,
                        format!("local ASN {} is used by more than one virtual router", router.local_asn),
                    ),
                ));
            }
        }

        let removed: Vec<String> = self
            .v1
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for name in removed.into_iter() {
            if let Some(mut state) = self.v1.remove(&name) {
                self.teardown_instance(&name, &mut state, controller_rows).await;
            }
        }

        for (name, router) in desired.into_iter() {
            let input = V1Input {
                manager: self.manager.clone(),
                snapshot: snapshot.clone(),
                policy_name: policy_name.clone(),
                router,
            };
            let state = self.v1.entry(name.clone()).or_default();
            let reports = run_pipeline(&V1Stage::PIPELINE, ctx, &input, state).await;
            v1::after_pass(&reports, state);
            instances.insert(name, reports);
        }
    }

    async fn reconcile_v2(
        &mut self,
        ctx: &ReconcileContext,
        snapshot: &Arc<Snapshot>,
        config: &CiliumBGPNodeConfig,
        instances: &mut BTreeMap<String, Vec<StageReport>>,
        controller_rows: &mut Vec<(&'static str, ResourceError)>,
    ) {
        let config_name = config.name_any();
        let mut desired = BTreeMap::new();
        let mut asns = BTreeSet::new();
        for instance in config.spec.bgp_instances.iter() {
            // Invalid ASNs are reported by the preflight stage.
            let asn = instance.local_asn.and_then(|a| validate_asn(a).ok());
            let duplicate_asn = asn.map(|a| !asns.insert(a)).unwrap_or(false);
            if duplicate_asn || desired.contains_key(&instance.name) {
                controller_rows.push((
                    STAGE_MODE_SELECTION,
                    ResourceError::config_invalid(
                        KIND_NODE_CONFIG,
                        &config_name,
                        format!("instance {} duplicates the name or local ASN of another instance", instance.name),
                    ),
                ));
                continue;
            }
            desired.insert(instance.name.clone(), instance.clone());
        }

        let removed: Vec<String> = self
            .v2
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for name in removed.into_iter() {
            if let Some(mut state) = self.v2.remove(&name) {
                self.teardown_instance(&name, &mut state, controller_rows).await;
            }
        }

        for (name, instance) in desired.into_iter() {
            let input = V2Input {
                manager: self.manager.clone(),
                snapshot: snapshot.clone(),
                instance,
            };
            let state = self.v2.entry(name.clone()).or_default();
            let reports = run_pipeline(&V2Stage::PIPELINE, ctx, &input, state).await;
            instances.insert(name, reports);
        }
    }

    async fn teardown_instance(
        &mut self,
        name: &str,
        state: &mut InstanceState,
        controller_rows: &mut Vec<(&'static str, ResourceError)>,
    ) {
        tracing::info!(instance = name, "removing instance");
        if let Err(e) = teardown(self.manager.as_ref(), state).await {
            tracing::warn!(instance = name, error = %e, "teardown completed with errors");
            controller_rows.push((
                STAGE_TEARDOWN,
                ResourceError::new(ErrorClass::Transient, crate::reconciler::KIND_ROUTER, name, e),
            ));
        }
        self.errors.delete_instance(name);
        self.backoff.forget(name);
    }

    async fn teardown_all_v1(&mut self, controller_rows: &mut Vec<(&'static str, ResourceError)>) {
        let instances = std::mem::take(&mut self.v1);
        for (name, mut state) in instances.into_iter() {
            self.teardown_instance(&name, &mut state, controller_rows).await;
        }
    }

    async fn teardown_all_v2(&mut self, controller_rows: &mut Vec<(&'static str, ResourceError)>) {
        let instances = std::mem::take(&mut self.v2);
        for (name, mut state) in instances.into_iter() {
            self.teardown_instance(&name, &mut state, controller_rows).await;
        }
    }

    /// Write the rows of one instance and drop the ones that cleared.
    fn record(&self, instance: &str, reports: &[StageReport]) {
        let ran: Vec<&str> = reports.iter().filter(|r| r.ran()).map(|r| r.stage).collect();
        let errors: Vec<(&'static str, ResourceError)> = reports
            .iter()
            .flat_map(|r| r.errors().into_iter().map(move |e| (r.stage, e)))
            .collect();
        for (_, e) in errors.iter() {
            self.metrics.reconcile_failure(e);
        }
        let observed = upsert_merged(&self.errors, instance, &errors);
        // Rows of stages that did not run this pass are kept as they are.
        self.errors.retain_instance(instance, |row| {
            !ran.iter().any(|s| *s == row.stage) || observed.contains(&row.key())
        });
    }

    fn record_controller_rows(&self, rows: &[(&'static str, ResourceError)]) {
        for (_, e) in rows.iter() {
            self.metrics.reconcile_failure(e);
        }
        let observed = upsert_merged(&self.errors, CONTROLLER_INSTANCE, rows);
        self.errors
            .retain_instance(CONTROLLER_INSTANCE, |row| observed.contains(&row.key()));
    }

    fn schedule_backoff(&mut self, instances: &BTreeMap<String, Vec<StageReport>>) {
        let mut next: Option<Duration> = None;
        for (instance, reports) in instances.iter() {
            for report in reports.iter() {
                match &report.status {
                    StageStatus::Skipped | StageStatus::NotRun => {}
                    _ if report.needs_retry() => {
                        let delay = self.backoff.failed(instance, report.stage);
                        next = Some(next.map(|n| n.min(delay)).unwrap_or(delay));
                    }
                    _ => self.backoff.succeeded(instance, report.stage),
                }
            }
        }
        if let Some(delay) = next {
            self.schedule_retry(delay);
        }
    }

    /// Arrange a wakeup after `delay`. A pending wakeup that is due earlier
    /// is kept.
    fn schedule_retry(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Some((due, handle)) = self.retry.take() {
            if !handle.is_finished() && due > Instant::now() && due <= deadline {
                self.retry = Some((due, handle));
                return;
            }
            handle.abort();
        }
        tracing::debug!(delay_secs = delay.as_secs(), "scheduling retry");
        let signaler = self.signaler.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            signaler.event();
        });
        self.retry = Some((deadline, handle));
    }

    async fn update_metrics(&self) {
        let mut sessions: BTreeMap<&'static str, i64> =
            SessionState::all().iter().map(|s| (s.as_str(), 0)).collect();
        match self.manager.get_peers(None).await {
            Ok(peers) => {
                for peer in peers.iter() {
                    *sessions.entry(peer.state.as_str()).or_insert(0) += 1;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read peer sessions"),
        }
        self.metrics.set_peer_sessions(sessions);
        let advertised: usize = self.manager.routers().iter().map(|r| r.paths.len()).sum();
        self.metrics.set_advertised_routes(advertised as i64);
        let counts = self.errors.count_by_kind();
        self.metrics
            .set_reconcile_errors(counts.iter().map(|(k, v)| (k.as_str(), *v)));
    }

    /// Tear down every router and stop the manager.
    pub async fn shutdown(&mut self) {
        if let Some((_, handle)) = self.retry.take() {
            handle.abort();
        }
        let mut rows = Vec::new();
        self.teardown_all_v1(&mut rows).await;
        self.teardown_all_v2(&mut rows).await;
        if let Err(e) = self.manager.stop().await {
            tracing::warn!(error = %e, "failed to stop router manager");
        }
        self.signaler.close();
        tracing::info!("stopped BGP Control Plane controller");
    }
}

/// Write one row per resource. Errors sharing a key within a pass are
/// folded into a single message so the row stays stable across passes.
fn upsert_merged(
    table: &ReconcileErrorTable,
    instance: &str,
    errors: &[(&'static str, ResourceError)],
) -> BTreeSet<ErrorKey> {
    let mut merged: BTreeMap<ErrorKey, (&'static str, BTreeSet<&str>)> = BTreeMap::new();
    for (stage, e) in errors.iter() {
        merged
            .entry(ErrorKey::new(instance, e.kind, &e.name))
            .or_insert_with(|| (*stage, BTreeSet::new()))
            .1
            .insert(e.message.as_str());
    }
    let mut observed = BTreeSet::new();
    for (key, (stage, messages)) in merged.into_iter() {
        let message = messages.into_iter().collect::<Vec<_>>().join("; ");
        table.upsert(key.clone(), stage, &message);
        observed.insert(key);
    }
    observed
}

/// Decide which pipeline owns this node. Rows raised here belong to the
/// controller instance.
fn select(snapshot: &Snapshot, rows: &mut Vec<(&'static str, ResourceError)>) -> Selection {
    let labels = snapshot.node_labels();
    let mut selecting = Vec::new();
    for policy in snapshot.peering_policies.iter() {
        match selector::matches(policy.spec.node_selector.as_ref(), &labels, Unset::MatchAll) {
            Ok(true) => selecting.push(policy.clone()),
            Ok(false) => {}
            Err(e) => rows.push((
                STAGE_MODE_SELECTION,
                ResourceError::config_invalid(KIND_PEERING_POLICY, &policy.name_any(), e),
            )),
        }
    }

    if let Some(config) = &snapshot.node_config {
        for policy in selecting.iter() {
            rows.push((
                STAGE_MODE_SELECTION,
                ResourceError::config_invalid(
                    KIND_PEERING_POLICY,
                    &policy.name_any(),
                    format!(
                        "ignored, node {} is configured by CiliumBGPNodeConfig {}",
                        snapshot.node_name,
                        config.name_any()
                    ),
                ),
            ));
        }
        return Selection::V2(config.clone());
    }

    match selecting.len() {
        0 => Selection::Disabled,
        1 => Selection::V1(selecting.remove(0)),
        _ => {
            let names = selecting
                .iter()
                .map(|p| p.name_any())
                .collect::<Vec<_>>()
                .join(", ");
            for policy in selecting.iter() {
                rows.push((
                    STAGE_MODE_SELECTION,
                    ResourceError::config_invalid(
                        KIND_PEERING_POLICY,
                        &policy.name_any(),
                        format!(
                            "policies {names} all select node {}, at most one is allowed",
                            snapshot.node_name
                        ),
                    ),
                ));
            }
            Selection::V1Ambiguous
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::fixture::{
        controller::Harness,
        reconciler::{bgp_instance, match_labels, node, node_config, peering_policy, virtual_router},
    };

    fn snapshot_with(
        policies: Vec<CiliumBGPPeeringPolicy>,
        config: Option<CiliumBGPNodeConfig>,
    ) -> Snapshot {
        Snapshot {
            node_name: "node1".to_string(),
            node: Some(Arc::new(node("node1", &[("bgp", "a")], "10.244.1.0/24", "192.168.0.11"))),
            peering_policies: policies.into_iter().map(Arc::new).collect(),
            node_config: config.map(Arc::new),
            ..Default::default()
        }
    }

    #[rstest(
        policies,
        config,
        expected,
        rows,
        case(vec![], None, ConfigMode::Disabled, 0),
        case(vec![peering_policy("a", None, vec![virtual_router(65001, vec![])])], None, ConfigMode::BGPv1, 0),
        case(
            vec![peering_policy("a", Some(match_labels(&[("bgp", "b")])), vec![])],
            None,
            ConfigMode::Disabled,
            0
        ),
        case(
            vec![
                peering_policy("a", None, vec![]),
                peering_policy("b", Some(match_labels(&[("bgp", "a")])), vec![]),
            ],
            None,
            ConfigMode::BGPv1,
            2
        ),
        case(
            vec![peering_policy("a", None, vec![])],
            Some(node_config("node1", vec![bgp_instance("main", 65001, vec![])])),
            ConfigMode::BGPv2,
            1
        )
    )]
    fn test_select(
        policies: Vec<CiliumBGPPeeringPolicy>,
        config: Option<CiliumBGPNodeConfig>,
        expected: ConfigMode,
        rows: usize,
    ) {
        let mut errors = Vec::new();
        let selection = select(&snapshot_with(policies, config), &mut errors);
        assert_eq!(expected, selection.mode());
        assert_eq!(rows, errors.len());
        assert!(errors.iter().all(|(_, e)| e.kind == KIND_PEERING_POLICY));
    }

    #[test]
    fn test_ambiguous_policies_apply_nothing() {
        let mut errors = Vec::new();
        let selection = select(
            &snapshot_with(
                vec![peering_policy("a", None, vec![]), peering_policy("b", None, vec![])],
                None,
            ),
            &mut errors,
        );
        assert!(matches!(selection, Selection::V1Ambiguous));
        assert!(errors[0].1.message.contains("a, b"));
    }

    #[test]
    fn test_errors_on_one_resource_share_a_row() {
        let table = ReconcileErrorTable::default();
        let first = vec![
            (
                "LBService",
                ResourceError::new(ErrorClass::Partial, "Service", "default/web", "172.16.0.10/32: boom"),
            ),
            (
                "LBService",
                ResourceError::new(ErrorClass::Partial, "Service", "default/web", "172.16.0.11/32: boom"),
            ),
        ];
        let observed = upsert_merged(&table, "asn-65001", &first);
        assert_eq!(1, observed.len());

        let second: Vec<_> = first.iter().rev().cloned().collect();
        upsert_merged(&table, "asn-65001", &second);
        let rows = table.list_instance("asn-65001");
        assert_eq!(1, rows.len());
        assert_eq!(2, rows[0].count);
        assert_eq!("172.16.0.10/32: boom; 172.16.0.11/32: boom", rows[0].error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_earliest_deadline() {
        let Harness {
            mut controller,
            signaler,
            ..
        } = Harness::new();
        let mut events = signaler.events().unwrap();

        controller.schedule_retry(Duration::from_secs(2));
        controller.schedule_retry(Duration::from_secs(30));
        let woke = tokio::time::timeout(Duration::from_secs(3), events.next()).await;
        assert!(matches!(woke, Ok(Some(()))));

        controller.schedule_retry(Duration::from_secs(30));
        controller.schedule_retry(Duration::from_secs(5));
        let woke = tokio::time::timeout(Duration::from_secs(6), events.next()).await;
        assert!(matches!(woke, Ok(Some(()))));
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        let delays: Vec<u64> = (0..7).map(|_| backoff.failed("i", "Neighbor").as_secs()).collect();
        assert_eq!(vec![2, 4, 8, 16, 32, 60, 60], delays);
        assert_eq!(2, backoff.failed("j", "Neighbor").as_secs());
        backoff.succeeded("i", "Neighbor");
        assert_eq!(2, backoff.failed("i", "Neighbor").as_secs());
        backoff.forget("i");
        assert!(backoff.delays.keys().all(|(i, _)| i != "i"));
    }
}
