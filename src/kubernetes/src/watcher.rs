use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node, Secret, Service};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    crd::{
        advertisement::CiliumBGPAdvertisement, lb_ip_pool::CiliumLoadBalancerIPPool,
        node_config::CiliumBGPNodeConfig, peer_config::CiliumBGPPeerConfig,
        peering_policy::CiliumBGPPeeringPolicy, pod_ip_pool::CiliumPodIPPool,
    },
    reconciler::snapshot::Stores,
    store::{StoreEvent, StoreWriter},
};

/// Feed watch events of `api` into `writer` until cancelled.
#[tracing::instrument(skip_all, fields(kind = %K::kind(&())))]
pub async fn run<K, W>(api: Api<K>, config: watcher::Config, writer: W, token: CancellationToken)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    W: StoreWriter<K>,
{
    let mut stream = watcher(api, config).default_backoff().boxed();
    tracing::info!("start watching");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Applied(obj))) => writer.apply(StoreEvent::Upsert(obj)),
                Some(Ok(watcher::Event::Deleted(obj))) => writer.apply(StoreEvent::Delete(obj)),
                Some(Ok(watcher::Event::Restarted(objs))) => {
                    tracing::debug!(count = objs.len(), "relisted");
                    writer.apply(StoreEvent::Restarted(objs))
                }
                Some(Err(e)) => tracing::warn!(error = %e, "watch failed"),
                None => break,
            }
        }
    }
    tracing::info!("stop watching");
}

/// Spawn one watcher per store. Pod IP pools and secrets are watched only
/// when their stores exist.
pub fn spawn_all(
    client: Client,
    node_name: &str,
    secrets_namespace: Option<&str>,
    stores: &Stores,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(run(
            Api::<Node>::all(client.clone()),
            watcher::Config::default().fields(&format!("metadata.name={node_name}")),
            stores.node.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<CiliumBGPPeeringPolicy>::all(client.clone()),
            watcher::Config::default(),
            stores.peering_policies.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<CiliumBGPNodeConfig>::all(client.clone()),
            watcher::Config::default(),
            stores.node_configs.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<CiliumBGPPeerConfig>::all(client.clone()),
            watcher::Config::default(),
            stores.peer_configs.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<CiliumBGPAdvertisement>::all(client.clone()),
            watcher::Config::default(),
            stores.advertisements.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<CiliumLoadBalancerIPPool>::all(client.clone()),
            watcher::Config::default(),
            stores.lb_pools.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<Service>::all(client.clone()),
            watcher::Config::default(),
            stores.services.clone(),
            token.clone(),
        )),
        tokio::spawn(run(
            Api::<Endpoints>::all(client.clone()),
            watcher::Config::default(),
            stores.endpoints.clone(),
            token.clone(),
        )),
    ];

    if let Some(pod_pools) = &stores.pod_pools {
        handles.push(tokio::spawn(run(
            Api::<CiliumPodIPPool>::all(client.clone()),
            watcher::Config::default(),
            pod_pools.clone(),
            token.clone(),
        )));
    }

    match (secrets_namespace, &stores.secrets) {
        (Some(ns), Some(secrets)) => {
            handles.push(tokio::spawn(run(
                Api::<Secret>::namespaced(client, ns),
                watcher::Config::default(),
                secrets.clone(),
                token,
            )));
        }
        _ => {
            tracing::warn!("BGP secrets namespace is not configured, peer authentication is unavailable");
        }
    }

    handles
}
