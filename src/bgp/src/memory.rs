use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Instant,
};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::{
    error::Error,
    path::{Path, PathKey, Route, RouteQuery, TableType},
    peer::{Neighbor, PeerStatus, SessionState},
    policy::{evaluate, PolicyDirection, RoutePolicy, Verdict},
    speaker::{GlobalConfig, Speaker, SpeakerFactory},
};

/// A call received by an in-memory speaker, tagged with the router's ASN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakerCall {
    Start { asn: u32 },
    Stop { asn: u32 },
    ConfigureNeighbor { asn: u32, address: IpAddr, peer_asn: u32 },
    ResetNeighbor { asn: u32, address: IpAddr },
    RemoveNeighbor { asn: u32, address: IpAddr },
    AdvertisePath { asn: u32, prefix: IpNet },
    WithdrawPath { asn: u32, prefix: IpNet },
    SetPolicies { asn: u32, names: Vec<String> },
}

/// Ordered record of every call made against speakers of one factory.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<SpeakerCall>>>,
}

impl CallLog {
    fn push(&self, call: SpeakerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    pub fn calls(&self) -> Vec<SpeakerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return and forget the calls recorded so far.
    pub fn take(&self) -> Vec<SpeakerCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct NeighborEntry {
    config: Neighbor,
    state: SessionState,
    established_at: Option<Instant>,
    received: BTreeMap<IpNet, Path>,
}

#[derive(Debug, Default)]
pub struct MemorySpeakerInner {
    neighbors: BTreeMap<IpAddr, NeighborEntry>,
    paths: BTreeMap<PathKey, (Path, Instant)>,
    policies: Vec<RoutePolicy>,
    failing: BTreeSet<IpAddr>,
    stopped: bool,
}

/// Speaker keeping its whole configuration in memory.
///
/// Sessions never leave Idle on their own. With `auto_establish` every
/// configured neighbor is reported Established straight away.
#[derive(Debug)]
pub struct MemorySpeaker {
    global: GlobalConfig,
    log: CallLog,
    auto_establish: bool,
    inner: Mutex<MemorySpeakerInner>,
}

impl MemorySpeaker {
    pub fn new(global: GlobalConfig, log: CallLog, auto_establish: bool) -> Self {
        MemorySpeaker {
            global,
            log,
            auto_establish,
            inner: Mutex::new(MemorySpeakerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemorySpeakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initial_state(&self) -> (SessionState, Option<Instant>) {
        if self.auto_establish {
            (SessionState::Established, Some(Instant::now()))
        } else {
            (SessionState::Idle, None)
        }
    }

    /// Force the session state of a configured neighbor.
    pub fn set_peer_state(&self, address: IpAddr, state: SessionState) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .neighbors
            .get_mut(&address)
            .ok_or(Error::PeerNotFound { addr: address })?;
        if state == SessionState::Established && entry.state != SessionState::Established {
            entry.established_at = Some(Instant::now());
        } else if state != SessionState::Established {
            entry.established_at = None;
        }
        entry.state = state;
        Ok(())
    }

    /// Pretend `address` sent us `path`.
    pub fn receive_path(&self, address: IpAddr, path: Path) -> Result<(), Error> {
        let mut inner = self.lock();
        let entry = inner
            .neighbors
            .get_mut(&address)
            .ok_or(Error::PeerNotFound { addr: address })?;
        entry.received.insert(path.prefix, path);
        Ok(())
    }

    /// Make every neighbor operation on `address` fail until cleared.
    pub fn set_failing(&self, address: IpAddr, failing: bool) {
        let mut inner = self.lock();
        if failing {
            inner.failing.insert(address);
        } else {
            inner.failing.remove(&address);
        }
    }

    pub fn neighbor(&self, address: IpAddr) -> Option<Neighbor> {
        self.lock().neighbors.get(&address).map(|e| e.config.clone())
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.lock()
            .neighbors
            .values()
            .map(|e| e.config.clone())
            .collect()
    }

    pub fn paths(&self) -> Vec<Path> {
        self.lock().paths.values().map(|(p, _)| p.clone()).collect()
    }

    pub fn policies(&self) -> Vec<RoutePolicy> {
        self.lock().policies.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn check(&self, inner: &MemorySpeakerInner, address: Option<IpAddr>) -> Result<(), Error> {
        if inner.stopped {
            return Err(Error::Stopped);
        }
        if let Some(addr) = address {
            if inner.failing.contains(&addr) {
                return Err(Error::Speaker(format!("neighbor {} is unreachable", addr)));
            }
        }
        Ok(())
    }

    fn adj_rib_out(&self, inner: &MemorySpeakerInner, entry: &NeighborEntry) -> Vec<Route> {
        inner
            .paths
            .values()
            .filter(|(path, _)| entry.config.families.contains(&path.family))
            .filter_map(|(path, since)| {
                match evaluate(
                    &inner.policies,
                    PolicyDirection::Export,
                    entry.config.address,
                    &path.prefix,
                    &path.attributes,
                ) {
                    Verdict::Accept(mut attributes) => {
                        // LOCAL_PREF is only sent to internal peers.
                        if !entry.config.is_ibgp(self.global.asn) {
                            attributes.local_preference = None;
                        }
                        Some(Route {
                            local_asn: self.global.asn,
                            family: path.family,
                            prefix: path.prefix,
                            next_hop: path.next_hop,
                            attributes,
                            age: since.elapsed(),
                            neighbor: Some(entry.config.address),
                            best: true,
                        })
                    }
                    Verdict::Reject => None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Speaker for MemorySpeaker {
    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    async fn configure_neighbor(&self, neighbor: &Neighbor) -> Result<(), Error> {
        let (state, established_at) = self.initial_state();
        let mut inner = self.lock();
        self.check(&inner, Some(neighbor.address))?;
        self.log.push(SpeakerCall::ConfigureNeighbor {
            asn: self.global.asn,
            address: neighbor.address,
            peer_asn: neighbor.peer_asn,
        });
        match inner.neighbors.get_mut(&neighbor.address) {
            Some(entry) => entry.config = neighbor.clone(),
            None => {
                inner.neighbors.insert(
                    neighbor.address,
                    NeighborEntry {
                        config: neighbor.clone(),
                        state,
                        established_at,
                        received: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn reset_neighbor(&self, address: IpAddr) -> Result<(), Error> {
        let (state, established_at) = self.initial_state();
        let mut inner = self.lock();
        self.check(&inner, Some(address))?;
        self.log.push(SpeakerCall::ResetNeighbor {
            asn: self.global.asn,
            address,
        });
        let entry = inner
            .neighbors
            .get_mut(&address)
            .ok_or(Error::PeerNotFound { addr: address })?;
        entry.state = state;
        entry.established_at = established_at;
        entry.received.clear();
        Ok(())
    }

    async fn remove_neighbor(&self, address: IpAddr) -> Result<(), Error> {
        let mut inner = self.lock();
        self.check(&inner, Some(address))?;
        self.log.push(SpeakerCall::RemoveNeighbor {
            asn: self.global.asn,
            address,
        });
        inner.neighbors.remove(&address);
        Ok(())
    }

    async fn advertise_path(&self, path: &Path) -> Result<(), Error> {
        let mut inner = self.lock();
        self.check(&inner, None)?;
        self.log.push(SpeakerCall::AdvertisePath {
            asn: self.global.asn,
            prefix: path.prefix,
        });
        inner
            .paths
            .insert(path.key(), (path.clone(), Instant::now()));
        Ok(())
    }

    async fn withdraw_path(&self, path: &Path) -> Result<(), Error> {
        let mut inner = self.lock();
        self.check(&inner, None)?;
        self.log.push(SpeakerCall::WithdrawPath {
            asn: self.global.asn,
            prefix: path.prefix,
        });
        inner.paths.remove(&path.key());
        Ok(())
    }

    async fn set_policies(&self, policies: &[RoutePolicy]) -> Result<(), Error> {
        let mut inner = self.lock();
        self.check(&inner, None)?;
        self.log.push(SpeakerCall::SetPolicies {
            asn: self.global.asn,
            names: policies.iter().map(|p| p.name.clone()).collect(),
        });
        inner.policies = policies.to_vec();
        Ok(())
    }

    async fn query_peers(&self) -> Result<Vec<PeerStatus>, Error> {
        let inner = self.lock();
        self.check(&inner, None)?;
        Ok(inner
            .neighbors
            .values()
            .map(|entry| PeerStatus {
                name: entry.config.name.clone(),
                local_asn: self.global.asn,
                address: entry.config.address,
                peer_asn: entry.config.peer_asn,
                peer_port: entry.config.peer_port,
                state: entry.state,
                uptime: entry.established_at.map(|t| t.elapsed()),
                routes_received: entry.received.len() as u64,
                routes_advertised: if entry.state == SessionState::Established {
                    self.adj_rib_out(&inner, entry).len() as u64
                } else {
                    0
                },
                timers: entry.config.timers,
                families: entry.config.families.clone(),
            })
            .collect())
    }

    async fn query_routes(&self, query: &RouteQuery) -> Result<Vec<Route>, Error> {
        let inner = self.lock();
        self.check(&inner, None)?;
        let neighbors = inner
            .neighbors
            .values()
            .filter(|e| query.neighbor.map(|n| n == e.config.address).unwrap_or(true));
        let mut routes = match query.table {
            TableType::LocRib => inner
                .paths
                .values()
                .map(|(path, since)| Route {
                    local_asn: self.global.asn,
                    family: path.family,
                    prefix: path.prefix,
                    next_hop: path.next_hop,
                    attributes: path.attributes.clone(),
                    age: since.elapsed(),
                    neighbor: None,
                    best: true,
                })
                .collect::<Vec<Route>>(),
            TableType::AdjRibIn => neighbors
                .flat_map(|entry| {
                    entry.received.values().map(|path| Route {
                        local_asn: self.global.asn,
                        family: path.family,
                        prefix: path.prefix,
                        next_hop: path.next_hop.or(Some(entry.config.address)),
                        attributes: path.attributes.clone(),
                        age: entry
                            .established_at
                            .map(|t| t.elapsed())
                            .unwrap_or_default(),
                        neighbor: Some(entry.config.address),
                        best: false,
                    })
                })
                .collect(),
            TableType::AdjRibOut => neighbors
                .filter(|e| e.state == SessionState::Established)
                .flat_map(|entry| self.adj_rib_out(&inner, entry))
                .collect(),
        };
        if let Some(family) = query.family {
            routes.retain(|r| r.family == family);
        }
        Ok(routes)
    }

    async fn query_policies(&self) -> Result<Vec<RoutePolicy>, Error> {
        let inner = self.lock();
        self.check(&inner, None)?;
        Ok(inner.policies.clone())
    }

    async fn stop(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.stopped {
            return Ok(());
        }
        self.log.push(SpeakerCall::Stop {
            asn: self.global.asn,
        });
        inner.stopped = true;
        inner.neighbors.clear();
        inner.paths.clear();
        inner.policies.clear();
        Ok(())
    }
}

/// Starts [`MemorySpeaker`]s and keeps a handle on each for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySpeakerFactory {
    log: CallLog,
    auto_establish: bool,
    fail_start: Arc<AtomicBool>,
    speakers: Arc<Mutex<BTreeMap<u32, Arc<MemorySpeaker>>>>,
}

impl MemorySpeakerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_establish(mut self, auto_establish: bool) -> Self {
        self.auto_establish = auto_establish;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Make subsequent starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Latest speaker started for `asn`.
    pub fn speaker(&self, asn: u32) -> Option<Arc<MemorySpeaker>> {
        self.speakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&asn)
            .cloned()
    }
}

#[async_trait]
impl SpeakerFactory for MemorySpeakerFactory {
    async fn start(&self, global: &GlobalConfig) -> Result<Arc<dyn Speaker>, Error> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Start {
                asn: global.asn,
                reason: "speaker refused to start".to_string(),
            });
        }
        self.log.push(SpeakerCall::Start { asn: global.asn });
        let speaker = Arc::new(MemorySpeaker::new(
            global.clone(),
            self.log.clone(),
            self.auto_establish,
        ));
        self.speakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(global.asn, speaker.clone());
        Ok(speaker)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        path::PathAttributes,
        policy::{Actions, Conditions, PrefixMatch, RouteAction, Statement},
    };

    fn global() -> GlobalConfig {
        GlobalConfig::new(65001, Ipv4Addr::new(192, 168, 0, 1))
    }

    #[tokio::test]
    async fn test_adj_rib_out_applies_export_policies() {
        let speaker = MemorySpeaker::new(global(), CallLog::default(), true);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        speaker
            .configure_neighbor(&Neighbor::new("a", a, 65002))
            .await
            .unwrap();
        speaker
            .configure_neighbor(&Neighbor::new("b", b, 65003))
            .await
            .unwrap();
        let prefix: IpNet = "10.100.0.0/24".parse().unwrap();
        speaker.advertise_path(&Path::new(prefix)).await.unwrap();
        speaker
            .set_policies(&[RoutePolicy::new("only-a", PolicyDirection::Export)
                .statement(Statement {
                    conditions: Conditions {
                        match_neighbors: vec![a],
                        match_prefixes: vec![PrefixMatch::exact(prefix)],
                        match_families: vec![],
                    },
                    actions: Actions {
                        route_action: RouteAction::Accept,
                        set_local_preference: Some(200),
                        ..Default::default()
                    },
                })
                .statement(Statement {
                    conditions: Conditions::default(),
                    actions: Actions {
                        route_action: RouteAction::Reject,
                        ..Default::default()
                    },
                })])
            .await
            .unwrap();

        let out = speaker
            .query_routes(&RouteQuery {
                table: TableType::AdjRibOut,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(1, out.len());
        assert_eq!(Some(a), out[0].neighbor);
        // eBGP peer, local preference stripped
        assert_eq!(None, out[0].attributes.local_preference);

        let peers = speaker.query_peers().await.unwrap();
        assert_eq!(1, peers.iter().find(|p| p.address == a).unwrap().routes_advertised);
        assert_eq!(0, peers.iter().find(|p| p.address == b).unwrap().routes_advertised);
    }

    #[tokio::test]
    async fn test_adj_rib_in_filters_by_neighbor() {
        let speaker = MemorySpeaker::new(global(), CallLog::default(), true);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for (name, addr, asn) in [("a", a, 65002), ("b", b, 65003)] {
            speaker
                .configure_neighbor(&Neighbor::new(name, addr, asn))
                .await
                .unwrap();
        }
        let learned = Path::new("172.16.0.0/16".parse().unwrap()).with_attributes(PathAttributes {
            communities: vec!["65002:100".to_string()],
            ..Default::default()
        });
        speaker.receive_path(a, learned).unwrap();
        assert!(speaker
            .receive_path("10.0.0.9".parse().unwrap(), Path::new("10.9.0.0/16".parse().unwrap()))
            .is_err());

        let routes = speaker
            .query_routes(&RouteQuery {
                table: TableType::AdjRibIn,
                neighbor: Some(a),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(1, routes.len());
        assert_eq!(Some(a), routes[0].next_hop);
        assert_eq!(vec!["65002:100".to_string()], routes[0].attributes.communities);

        let routes = speaker
            .query_routes(&RouteQuery {
                table: TableType::AdjRibIn,
                neighbor: Some(b),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(routes.is_empty());
        let peers = speaker.query_peers().await.unwrap();
        assert_eq!(1, peers.iter().find(|p| p.address == a).unwrap().routes_received);
    }

    #[tokio::test]
    async fn test_failing_neighbor() {
        let speaker = MemorySpeaker::new(global(), CallLog::default(), false);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        speaker.set_failing(a, true);
        assert!(speaker
            .configure_neighbor(&Neighbor::new("a", a, 65002))
            .await
            .is_err());
        speaker.set_failing(a, false);
        speaker
            .configure_neighbor(&Neighbor::new("a", a, 65002))
            .await
            .unwrap();
        let peers = speaker.query_peers().await.unwrap();
        assert_eq!(SessionState::Idle, peers[0].state);
        speaker.set_peer_state(a, SessionState::Established).unwrap();
        let peers = speaker.query_peers().await.unwrap();
        assert_eq!(SessionState::Established, peers[0].state);
        assert!(peers[0].uptime.is_some());
    }

    #[tokio::test]
    async fn test_factory_records_calls() {
        let factory = MemorySpeakerFactory::new();
        let log = factory.log();
        let speaker = factory.start(&global()).await.unwrap();
        speaker.stop().await.unwrap();
        speaker.stop().await.unwrap();
        assert_eq!(
            vec![
                SpeakerCall::Start { asn: 65001 },
                SpeakerCall::Stop { asn: 65001 }
            ],
            log.calls()
        );
        factory.set_fail_start(true);
        assert!(factory.start(&global()).await.err().unwrap().is_fatal());
    }
}
