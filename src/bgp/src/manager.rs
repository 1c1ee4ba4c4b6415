use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::Error,
    path::{Path, PathKey, Route, RouteQuery},
    peer::{Neighbor, PeerStatus},
    policy::RoutePolicy,
    speaker::{GlobalConfig, Speaker, SpeakerFactory},
};

/// Configuration last applied to a router.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterState {
    pub global: GlobalConfig,
    pub neighbors: BTreeMap<IpAddr, Neighbor>,
    pub paths: BTreeMap<PathKey, Path>,
    pub policies: Vec<RoutePolicy>,
}

impl RouterState {
    fn new(global: GlobalConfig) -> Self {
        RouterState {
            global,
            neighbors: BTreeMap::new(),
            paths: BTreeMap::new(),
            policies: Vec::new(),
        }
    }
}

/// Set of virtual routers keyed by local ASN.
///
/// Mutations are idempotent: asking for the state a router already has
/// issues no call to the speaker.
#[async_trait]
pub trait RouterManager: Send + Sync {
    async fn create_router(&self, global: &GlobalConfig) -> Result<(), Error>;
    async fn destroy_router(&self, asn: u32) -> Result<(), Error>;
    /// Converge the peers of the router to `peers`, creating the router
    /// when it does not exist yet.
    async fn configure_peers(&self, global: &GlobalConfig, peers: &[Neighbor])
        -> Result<(), Error>;
    async fn advertise_path(&self, asn: u32, path: &Path) -> Result<(), Error>;
    async fn withdraw_path(&self, asn: u32, path: &Path) -> Result<(), Error>;
    async fn set_policies(&self, asn: u32, policies: &[RoutePolicy]) -> Result<(), Error>;
    fn router(&self, asn: u32) -> Option<Arc<RouterState>>;
    fn routers(&self) -> Vec<Arc<RouterState>>;
    async fn get_peers(&self, asn: Option<u32>) -> Result<Vec<PeerStatus>, Error>;
    async fn get_routes(&self, asn: Option<u32>, query: &RouteQuery) -> Result<Vec<Route>, Error>;
    async fn get_route_policies(
        &self,
        asn: Option<u32>,
    ) -> Result<BTreeMap<u32, Vec<RoutePolicy>>, Error>;
    async fn stop(&self) -> Result<(), Error>;
}

struct Router {
    speaker: Arc<dyn Speaker>,
    op: Mutex<()>,
    state: RwLock<Arc<RouterState>>,
}

impl Router {
    fn snapshot(&self) -> Arc<RouterState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn commit(&self, next: RouterState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

pub struct BgpRouterManager {
    factory: Arc<dyn SpeakerFactory>,
    lifecycle: Mutex<()>,
    routers: RwLock<BTreeMap<u32, Arc<Router>>>,
}

impl BgpRouterManager {
    pub fn new(factory: Arc<dyn SpeakerFactory>) -> Self {
        BgpRouterManager {
            factory,
            lifecycle: Mutex::new(()),
            routers: RwLock::new(BTreeMap::new()),
        }
    }

    fn get(&self, asn: u32) -> Option<Arc<Router>> {
        self.routers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&asn)
            .cloned()
    }

    fn lookup(&self, asn: u32) -> Result<Arc<Router>, Error> {
        self.get(asn).ok_or(Error::RouterNotFound { asn })
    }

    fn select(&self, asn: Option<u32>) -> Result<Vec<Arc<Router>>, Error> {
        match asn {
            Some(asn) => Ok(vec![self.lookup(asn)?]),
            None => Ok(self
                .routers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect()),
        }
    }

    async fn ensure_router(&self, global: &GlobalConfig) -> Result<Arc<Router>, Error> {
        let _guard = self.lifecycle.lock().await;
        if let Some(router) = self.get(global.asn) {
            let current = router.snapshot();
            if current.global == *global {
                return Ok(router);
            }
            if current.global.router_id != global.router_id {
                return Err(Error::RouterIdMismatch {
                    asn: global.asn,
                    current: current.global.router_id,
                    requested: global.router_id,
                });
            }
            return Err(Error::RouterExists { asn: global.asn });
        }

        let speaker = self.factory.start(global).await?;
        tracing::info!(
            asn = global.asn,
            router_id = %global.router_id,
            listen_port = ?global.listen_port,
            "started router"
        );
        let router = Arc::new(Router {
            speaker,
            op: Mutex::new(()),
            state: RwLock::new(Arc::new(RouterState::new(global.clone()))),
        });
        self.routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(global.asn, router.clone());
        Ok(router)
    }

    async fn apply_peer(
        speaker: &dyn Speaker,
        current: Option<&Neighbor>,
        desired: &Neighbor,
    ) -> Result<bool, Error> {
        match current {
            Some(have) if have == desired => return Ok(false),
            Some(have) if have.peer_asn != desired.peer_asn => {
                tracing::info!(
                    addr = %desired.address,
                    old_asn = have.peer_asn,
                    new_asn = desired.peer_asn,
                    "peer ASN changed, recreating peer"
                );
                speaker.remove_neighbor(desired.address).await?;
            }
            Some(have) if have.requires_reset(desired) => {
                tracing::info!(addr = %desired.address, "resetting peer");
                speaker.reset_neighbor(desired.address).await?;
            }
            _ => {}
        }
        speaker.configure_neighbor(desired).await?;
        Ok(true)
    }
}

#[async_trait]
impl RouterManager for BgpRouterManager {
    #[tracing::instrument(skip_all, fields(asn = global.asn))]
    async fn create_router(&self, global: &GlobalConfig) -> Result<(), Error> {
        self.ensure_router(global).await.map(|_| ())
    }

    #[tracing::instrument(skip(self))]
    async fn destroy_router(&self, asn: u32) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        let router = match self
            .routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&asn)
        {
            Some(router) => router,
            None => return Ok(()),
        };
        let _op = router.op.lock().await;
        router.speaker.stop().await?;
        tracing::info!(asn, "stopped router");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(asn = global.asn))]
    async fn configure_peers(
        &self,
        global: &GlobalConfig,
        peers: &[Neighbor],
    ) -> Result<(), Error> {
        let mut desired: BTreeMap<IpAddr, &Neighbor> = BTreeMap::new();
        for peer in peers.iter() {
            if desired.insert(peer.address, peer).is_some() {
                return Err(Error::DuplicatePeer { addr: peer.address });
            }
        }

        let router = self.ensure_router(global).await?;
        let _op = router.op.lock().await;
        let current = router.snapshot();
        let mut next = (*current).clone();
        let mut errors = Vec::new();

        for addr in current.neighbors.keys() {
            if desired.contains_key(addr) {
                continue;
            }
            match router.speaker.remove_neighbor(*addr).await {
                Ok(()) => {
                    tracing::info!(addr = %addr, "removed peer");
                    next.neighbors.remove(addr);
                }
                Err(e) => errors.push(Error::peer(*addr, e)),
            }
        }

        for (addr, want) in desired.into_iter() {
            let have = current.neighbors.get(&addr);
            match Self::apply_peer(router.speaker.as_ref(), have, want).await {
                Ok(true) => {
                    tracing::info!(addr = %addr, peer_asn = want.peer_asn, "configured peer");
                    next.neighbors.insert(addr, want.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    // The session is in an unknown state now, force a full
                    // reconfiguration next time.
                    next.neighbors.remove(&addr);
                    errors.push(Error::peer(addr, e));
                }
            }
        }

        router.commit(next);
        Error::batch(errors)
    }

    async fn advertise_path(&self, asn: u32, path: &Path) -> Result<(), Error> {
        let router = self.lookup(asn)?;
        let _op = router.op.lock().await;
        let current = router.snapshot();
        if current.paths.get(&path.key()) == Some(path) {
            return Ok(());
        }
        router
            .speaker
            .advertise_path(path)
            .await
            .map_err(|e| Error::path(path.prefix, e))?;
        let mut next = (*current).clone();
        next.paths.insert(path.key(), path.clone());
        router.commit(next);
        tracing::info!(asn, prefix = %path.prefix, "advertised path");
        Ok(())
    }

    async fn withdraw_path(&self, asn: u32, path: &Path) -> Result<(), Error> {
        let router = match self.get(asn) {
            Some(router) => router,
            None => return Ok(()),
        };
        let _op = router.op.lock().await;
        let current = router.snapshot();
        if !current.paths.contains_key(&path.key()) {
            return Ok(());
        }
        router
            .speaker
            .withdraw_path(path)
            .await
            .map_err(|e| Error::path(path.prefix, e))?;
        let mut next = (*current).clone();
        next.paths.remove(&path.key());
        router.commit(next);
        tracing::info!(asn, prefix = %path.prefix, "withdrew path");
        Ok(())
    }

    async fn set_policies(&self, asn: u32, policies: &[RoutePolicy]) -> Result<(), Error> {
        let router = self.lookup(asn)?;
        let _op = router.op.lock().await;
        let current = router.snapshot();
        if current.policies == policies {
            return Ok(());
        }
        router.speaker.set_policies(policies).await?;
        let mut next = (*current).clone();
        next.policies = policies.to_vec();
        router.commit(next);
        tracing::info!(asn, count = policies.len(), "replaced route policies");
        Ok(())
    }

    fn router(&self, asn: u32) -> Option<Arc<RouterState>> {
        self.get(asn).map(|r| r.snapshot())
    }

    fn routers(&self) -> Vec<Arc<RouterState>> {
        self.routers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| r.snapshot())
            .collect()
    }

    async fn get_peers(&self, asn: Option<u32>) -> Result<Vec<PeerStatus>, Error> {
        let mut peers = Vec::new();
        for router in self.select(asn)?.iter() {
            peers.extend(router.speaker.query_peers().await?);
        }
        Ok(peers)
    }

    async fn get_routes(&self, asn: Option<u32>, query: &RouteQuery) -> Result<Vec<Route>, Error> {
        let mut routes = Vec::new();
        for router in self.select(asn)?.iter() {
            routes.extend(router.speaker.query_routes(query).await?);
        }
        Ok(routes)
    }

    async fn get_route_policies(
        &self,
        asn: Option<u32>,
    ) -> Result<BTreeMap<u32, Vec<RoutePolicy>>, Error> {
        let mut policies = BTreeMap::new();
        for router in self.select(asn)?.iter() {
            policies.insert(
                router.speaker.global().asn,
                router.speaker.query_policies().await?,
            );
        }
        Ok(policies)
    }

    async fn stop(&self) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        let routers = std::mem::take(
            &mut *self
                .routers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut errors = Vec::new();
        for (asn, router) in routers.into_iter() {
            let _op = router.op.lock().await;
            match router.speaker.stop().await {
                Ok(()) => tracing::info!(asn, "stopped router"),
                Err(e) => errors.push(e),
            }
        }
        Error::batch(errors)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;
    use crate::{
        memory::{MemorySpeakerFactory, SpeakerCall},
        peer::SessionState,
        policy::PolicyDirection,
    };

    fn global() -> GlobalConfig {
        GlobalConfig::new(65001, Ipv4Addr::new(192, 168, 0, 1))
    }

    fn peer(addr: &str, asn: u32) -> Neighbor {
        Neighbor::new(addr, addr.parse().unwrap(), asn)
    }

    fn setup() -> (MemorySpeakerFactory, BgpRouterManager) {
        let factory = MemorySpeakerFactory::new();
        let manager = BgpRouterManager::new(Arc::new(factory.clone()));
        (factory, manager)
    }

    #[tokio::test]
    async fn test_configure_peers_is_idempotent() {
        let (factory, manager) = setup();
        let log = factory.log();
        let peers = vec![peer("10.0.0.1", 65002), peer("10.0.0.2", 65003)];
        manager.configure_peers(&global(), &peers).await.unwrap();
        assert_eq!(
            vec![
                SpeakerCall::Start { asn: 65001 },
                SpeakerCall::ConfigureNeighbor {
                    asn: 65001,
                    address: "10.0.0.1".parse().unwrap(),
                    peer_asn: 65002
                },
                SpeakerCall::ConfigureNeighbor {
                    asn: 65001,
                    address: "10.0.0.2".parse().unwrap(),
                    peer_asn: 65003
                },
            ],
            log.take()
        );

        manager.configure_peers(&global(), &peers).await.unwrap();
        assert!(log.is_empty());
    }

    #[rstest]
    #[case(
        |n: &mut Neighbor| n.timers.hold_time_secs = 30,
        vec![
            SpeakerCall::ResetNeighbor { asn: 65001, address: "10.0.0.1".parse().unwrap() },
            SpeakerCall::ConfigureNeighbor { asn: 65001, address: "10.0.0.1".parse().unwrap(), peer_asn: 65002 },
        ]
    )]
    #[case(
        |n: &mut Neighbor| n.peer_asn = 65010,
        vec![
            SpeakerCall::RemoveNeighbor { asn: 65001, address: "10.0.0.1".parse().unwrap() },
            SpeakerCall::ConfigureNeighbor { asn: 65001, address: "10.0.0.1".parse().unwrap(), peer_asn: 65010 },
        ]
    )]
    #[case(
        |n: &mut Neighbor| n.families = vec![crate::family::Family::IPV4_UNICAST],
        vec![
            SpeakerCall::ConfigureNeighbor { asn: 65001, address: "10.0.0.1".parse().unwrap(), peer_asn: 65002 },
        ]
    )]
    #[tokio::test]
    async fn test_update_peer(#[case] update: fn(&mut Neighbor), #[case] expected: Vec<SpeakerCall>) {
        let (factory, manager) = setup();
        let log = factory.log();
        let untouched = peer("10.0.0.2", 65003);
        let mut target = peer("10.0.0.1", 65002);
        manager
            .configure_peers(&global(), &[target.clone(), untouched.clone()])
            .await
            .unwrap();
        log.take();

        update(&mut target);
        manager
            .configure_peers(&global(), &[target.clone(), untouched])
            .await
            .unwrap();
        assert_eq!(expected, log.take());
        let state = manager.router(65001).unwrap();
        assert_eq!(Some(&target), state.neighbors.get(&target.address));
    }

    #[tokio::test]
    async fn test_remove_peer_preserves_others() {
        let (factory, manager) = setup();
        let log = factory.log();
        manager
            .configure_peers(&global(), &[peer("10.0.0.1", 65002), peer("10.0.0.2", 65003)])
            .await
            .unwrap();
        log.take();
        manager
            .configure_peers(&global(), &[peer("10.0.0.2", 65003)])
            .await
            .unwrap();
        assert_eq!(
            vec![SpeakerCall::RemoveNeighbor {
                asn: 65001,
                address: "10.0.0.1".parse().unwrap()
            }],
            log.take()
        );
    }

    #[tokio::test]
    async fn test_duplicate_peer_address() {
        let (_factory, manager) = setup();
        let res = manager
            .configure_peers(&global(), &[peer("10.0.0.1", 65002), peer("10.0.0.1", 65003)])
            .await;
        assert!(matches!(res, Err(Error::DuplicatePeer { .. })));
        assert!(manager.router(65001).is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_is_best_effort() {
        let (factory, manager) = setup();
        manager.create_router(&global()).await.unwrap();
        let speaker = factory.speaker(65001).unwrap();
        speaker.set_failing("10.0.0.1".parse().unwrap(), true);

        let err = manager
            .configure_peers(&global(), &[peer("10.0.0.1", 65002), peer("10.0.0.2", 65003)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Peer { .. }));
        assert!(!err.is_fatal());
        let state = manager.router(65001).unwrap();
        assert_eq!(1, state.neighbors.len());
        assert!(state.neighbors.contains_key(&"10.0.0.2".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn test_router_id_change_is_rejected() {
        let (_factory, manager) = setup();
        manager.create_router(&global()).await.unwrap();
        let mut other = global();
        other.router_id = Ipv4Addr::new(192, 168, 0, 2);
        assert!(matches!(
            manager.configure_peers(&other, &[]).await,
            Err(Error::RouterIdMismatch { .. })
        ));
        other = global();
        other.listen_port = Some(1179);
        assert!(matches!(
            manager.create_router(&other).await,
            Err(Error::RouterExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_paths_and_policies() {
        let (factory, manager) = setup();
        let log = factory.log();
        manager.create_router(&global()).await.unwrap();
        let path = Path::new("10.244.0.0/24".parse().unwrap());
        manager.advertise_path(65001, &path).await.unwrap();
        manager.advertise_path(65001, &path).await.unwrap();
        let policies = vec![RoutePolicy::new("p", PolicyDirection::Export)];
        manager.set_policies(65001, &policies).await.unwrap();
        manager.set_policies(65001, &policies).await.unwrap();
        manager.withdraw_path(65001, &path).await.unwrap();
        manager.withdraw_path(65001, &path).await.unwrap();
        assert_eq!(
            vec![
                SpeakerCall::Start { asn: 65001 },
                SpeakerCall::AdvertisePath {
                    asn: 65001,
                    prefix: path.prefix
                },
                SpeakerCall::SetPolicies {
                    asn: 65001,
                    names: vec!["p".to_string()]
                },
                SpeakerCall::WithdrawPath {
                    asn: 65001,
                    prefix: path.prefix
                },
            ],
            log.take()
        );
        assert!(matches!(
            manager.advertise_path(65009, &path).await,
            Err(Error::RouterNotFound { asn: 65009 })
        ));
    }

    #[tokio::test]
    async fn test_queries_span_routers() {
        let (factory, manager) = setup();
        manager
            .configure_peers(&global(), &[peer("10.0.0.1", 65002)])
            .await
            .unwrap();
        manager
            .configure_peers(
                &GlobalConfig::new(65100, Ipv4Addr::new(192, 168, 0, 1)),
                &[peer("10.0.1.1", 65101)],
            )
            .await
            .unwrap();
        factory
            .speaker(65001)
            .unwrap()
            .set_peer_state("10.0.0.1".parse().unwrap(), SessionState::Established)
            .unwrap();

        let all = manager.get_peers(None).await.unwrap();
        assert_eq!(2, all.len());
        let one = manager.get_peers(Some(65001)).await.unwrap();
        assert_eq!(1, one.len());
        assert_eq!(SessionState::Established, one[0].state);
        assert!(manager.get_peers(Some(1)).await.is_err());
        assert_eq!(2, manager.get_route_policies(None).await.unwrap().len());
    }

    #[tokio::test]
    async fn test_destroy_and_stop() {
        let (factory, manager) = setup();
        manager.create_router(&global()).await.unwrap();
        manager
            .create_router(&GlobalConfig::new(65100, Ipv4Addr::new(192, 168, 0, 1)))
            .await
            .unwrap();
        manager.destroy_router(65001).await.unwrap();
        manager.destroy_router(65001).await.unwrap();
        assert!(factory.speaker(65001).unwrap().is_stopped());
        assert_eq!(1, manager.routers().len());
        manager.stop().await.unwrap();
        assert!(manager.routers().is_empty());
        assert!(factory.speaker(65100).unwrap().is_stopped());
    }
}
