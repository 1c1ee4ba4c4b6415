pub mod config;
pub mod controller;
pub mod error;
pub mod server;

use std::sync::Arc;

use actix_web::{middleware, web::Data, App, HttpServer};
use bgpcp_bgp::{manager::BgpRouterManager, memory::MemorySpeakerFactory};
use bgpcp_trace::init::{prepare_tracing, TraceConfig};
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::{
    context::State,
    mode::Mode,
    reconciler::{snapshot::Stores, v2::state::KubeStatusWriter},
    signaler::Signaler,
    tables::ReconcileErrorTable,
    watcher,
};

use self::{
    config::Config,
    controller::{Components, Controller},
    error::Error,
    server::ApiState,
};

pub fn start(config: Config, trace: TraceConfig) -> Result<(), Error> {
    prepare_tracing(trace).map_err(Error::Trace)?;
    config.validate()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

#[tracing::instrument(skip_all)]
async fn run(config: Config) -> Result<(), Error> {
    let node_name = config.resolve_node_name()?;
    let secrets_namespace = config.secrets_namespace();
    if secrets_namespace.is_none() {
        tracing::warn!("secrets namespace is not set, BGP peer authentication is disabled");
    }

    let state = State::new("bgpcp-agent");
    let metrics = state.to_metrics().map_err(Error::Metrics)?;

    let client = Client::try_default().await.map_err(Error::Kube)?;
    let token = CancellationToken::new();
    let signaler = Signaler::new();
    let stores = Stores::new(&signaler, secrets_namespace, config.pod_ip_pools_enabled());

    let manager = Arc::new(BgpRouterManager::new(Arc::new(MemorySpeakerFactory::new())));
    let errors = Arc::new(ReconcileErrorTable::new(config.error_table_capacity));

    let watchers = if config.enabled {
        watcher::spawn_all(
            client.clone(),
            &node_name,
            secrets_namespace,
            &stores,
            token.child_token(),
        )
    } else {
        Vec::new()
    };

    let controller = Controller::new(
        &config,
        &node_name,
        Components {
            stores,
            signaler,
            mode: Mode::default(),
            manager: manager.clone(),
            errors: errors.clone(),
            status_writer: Arc::new(KubeStatusWriter::new(client)),
            metrics,
            diagnostics: state.diagnostics.clone(),
        },
        token.child_token(),
    );
    let api = ApiState {
        manager,
        errors,
        controller: controller.state(),
    };

    tracing::info!(node = %node_name, enabled = config.enabled, "Start BGP Control Plane agent");
    let controller_handle = tokio::spawn(controller.run());

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .app_data(Data::new(api.clone()))
            .configure(server::configure)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(format!("0.0.0.0:{}", config.http_port))?
    .shutdown_timeout(5);

    tracing::info!(http_port = config.http_port, "Agent server is running.");
    server.run().await?;

    tracing::info!("Shutting down");
    token.cancel();
    for handle in watchers.into_iter() {
        let _ = handle.await;
    }
    match controller_handle.await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!(error = %e, "controller task panicked");
            Ok(())
        }
    }
}
