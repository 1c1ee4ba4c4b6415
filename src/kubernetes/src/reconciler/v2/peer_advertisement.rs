use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};

use bgpcp_bgp::{family::Family, path::PathAttributes};
use ipnet::IpNet;
use kube::ResourceExt;

use crate::{
    crd::{
        advertisement::{AdvertisementType, BGPAdvertisement, CiliumBGPAdvertisement, ServiceAddressType},
        node_config::CiliumBGPNodePeer,
        peer_config::CiliumBGPPeerConfig,
    },
    reconciler::{
        common::{
            cluster_ips, external_ips, has_eligible_endpoint, host_prefixes, is_load_balancer,
            load_balancer_ips, service_labels, TrafficPolicy,
        },
        snapshot::Snapshot,
        ResourceError, KIND_ADVERTISEMENT, KIND_PEER_CONFIG,
    },
    selector::{self, Unset},
    store::ObjectKey,
    util::parse_peer_address,
};

use super::V2Input;

/// An advertisement entry that applies to a peer for one family.
#[derive(Debug, Clone)]
pub struct PeerAdvertisement<'a> {
    pub family: Family,
    pub advertisement: String,
    pub entry: &'a BGPAdvertisement,
}

/// Pair every family of the peer config with the advertisements its
/// selector picks, ordered by family then advertisement name. A family
/// without selector advertises nothing.
pub fn peer_advertisements<'a>(
    peer_config: &CiliumBGPPeerConfig,
    advertisements: &'a [Arc<CiliumBGPAdvertisement>],
) -> Result<Vec<PeerAdvertisement<'a>>, ResourceError> {
    let config_name = peer_config.name_any();
    let invalid = |e: &dyn std::fmt::Display| {
        ResourceError::config_invalid(KIND_PEER_CONFIG, &config_name, e)
    };

    let mut result = Vec::new();
    for family in peer_config.spec.families.iter().flatten() {
        let f = family.to_family().map_err(|e| invalid(&e))?;
        for advert in advertisements.iter() {
            let selected = selector::matches(
                family.advertisements.as_ref(),
                advert.labels(),
                Unset::MatchNone,
            )
            .map_err(|e| invalid(&e))?;
            if !selected {
                continue;
            }
            for entry in advert.spec.advertisements.iter() {
                result.push(PeerAdvertisement {
                    family: f,
                    advertisement: advert.name_any(),
                    entry,
                });
            }
        }
    }
    // Stable sort keeps the entry order inside one advertisement.
    result.sort_by(|a, b| (a.family, &a.advertisement).cmp(&(b.family, &b.advertisement)));
    Ok(result)
}

/// Routes selected for one peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerRoutes {
    pub name: String,
    pub address: Option<IpAddr>,
    pub routes: BTreeMap<IpNet, PathAttributes>,
}

/// Everything the advertisement stages of one instance need, computed from
/// a single snapshot.
#[derive(Debug, Clone, Default)]
pub struct DesiredRoutes {
    pub peers: Vec<PeerRoutes>,
    pub by_type: BTreeMap<AdvertisementType, BTreeSet<IpNet>>,
    pub errors: Vec<ResourceError>,
}

impl DesiredRoutes {
    pub fn prefixes(&self, advertisement_type: AdvertisementType) -> BTreeSet<IpNet> {
        self.by_type
            .get(&advertisement_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Owner of a prefix for error reporting.
    pub fn owner(&self, prefix: &IpNet) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.routes.contains_key(prefix))
            .map(|p| p.name.as_str())
    }
}

fn service_prefixes(entry: &BGPAdvertisement, snapshot: &Snapshot) -> Result<BTreeSet<IpNet>, crate::error::Error> {
    let mut prefixes = BTreeSet::new();
    let addresses = match &entry.service {
        Some(opts) => &opts.addresses,
        None => return Ok(prefixes),
    };
    for (key, svc) in snapshot.services.iter() {
        if !selector::matches(entry.selector.as_ref(), &service_labels(svc), Unset::MatchNone)? {
            continue;
        }
        let endpoints = snapshot.endpoints.get(key).map(|e| e.as_ref());
        let eligible = |policy| has_eligible_endpoint(svc, endpoints, &snapshot.node_name, policy);
        for address in addresses.iter() {
            let ips = match address {
                ServiceAddressType::LoadBalancerIP
                    if is_load_balancer(svc) && eligible(TrafficPolicy::External) =>
                {
                    load_balancer_ips(svc)
                }
                ServiceAddressType::ClusterIP if eligible(TrafficPolicy::Internal) => cluster_ips(svc),
                ServiceAddressType::ExternalIP if eligible(TrafficPolicy::External) => external_ips(svc),
                _ => Vec::new(),
            };
            prefixes.extend(host_prefixes(&ips));
        }
    }
    Ok(prefixes)
}

fn entry_prefixes(
    entry: &BGPAdvertisement,
    snapshot: &Snapshot,
) -> Result<BTreeSet<IpNet>, crate::error::Error> {
    match entry.advertisement_type {
        AdvertisementType::PodCIDR => Ok(snapshot.pod_cidrs().into_iter().collect()),
        AdvertisementType::Service => service_prefixes(entry, snapshot),
        AdvertisementType::CiliumPodIPPool => {
            let mut prefixes = BTreeSet::new();
            for pool in snapshot.pod_pools.iter() {
                if pool.spec.disabled
                    || !selector::matches(entry.selector.as_ref(), pool.labels(), Unset::MatchNone)?
                {
                    continue;
                }
                prefixes.extend(pool.cidrs());
            }
            Ok(prefixes)
        }
    }
}

fn peer_routes(
    peer: &CiliumBGPNodePeer,
    local_asn: Option<i64>,
    snapshot: &Snapshot,
    desired: &mut DesiredRoutes,
) -> PeerRoutes {
    let mut result = PeerRoutes {
        name: peer.name.clone(),
        address: peer.peer_address.as_deref().and_then(parse_peer_address),
        routes: BTreeMap::new(),
    };
    // A missing peer config is reported by the neighbor stage.
    let config = match peer
        .peer_config_ref
        .as_ref()
        .and_then(|r| snapshot.peer_configs.get(&r.name))
    {
        Some(config) => config,
        None => return result,
    };
    let adverts = match peer_advertisements(config, &snapshot.advertisements) {
        Ok(adverts) => adverts,
        Err(e) => {
            desired.errors.push(e);
            return result;
        }
    };
    let ibgp = local_asn.is_some() && peer.peer_asn == local_asn;
    for advert in adverts.iter() {
        let invalid = |e: &dyn std::fmt::Display| {
            ResourceError::config_invalid(KIND_ADVERTISEMENT, &advert.advertisement, e)
        };
        let attributes = match &advert.entry.attributes {
            Some(attrs) => match attrs.to_path_attributes(ibgp) {
                Ok(a) => a,
                Err(e) => {
                    desired.errors.push(invalid(&e));
                    continue;
                }
            },
            None => PathAttributes::default(),
        };
        let prefixes = match entry_prefixes(advert.entry, snapshot) {
            Ok(p) => p,
            Err(e) => {
                desired.errors.push(invalid(&e));
                continue;
            }
        };
        let by_type = desired
            .by_type
            .entry(advert.entry.advertisement_type)
            .or_default();
        for prefix in prefixes.into_iter().filter(|p| advert.family.carries(p)) {
            by_type.insert(prefix);
            result
                .routes
                .entry(prefix)
                .or_default()
                .merge(&attributes);
        }
    }
    result
}

/// Routes of every peer of the instance and the per-type union the
/// advertisement stages announce.
pub fn desired_routes(input: &V2Input) -> DesiredRoutes {
    let snapshot = input.snapshot.as_ref();
    let mut desired = DesiredRoutes::default();
    for peer in input.instance.peers.iter().flatten() {
        let routes = peer_routes(peer, input.instance.local_asn, snapshot, &mut desired);
        desired.peers.push(routes);
    }
    desired.errors.dedup();
    desired
}

/// Services touched by an advertisement, used in rows.
pub fn service_owner(snapshot: &Snapshot, prefix: &IpNet) -> Option<ObjectKey> {
    snapshot
        .services
        .iter()
        .find(|(_, svc)| {
            load_balancer_ips(svc)
                .into_iter()
                .chain(cluster_ips(svc))
                .chain(external_ips(svc))
                .any(|ip| IpNet::from(ip) == *prefix)
        })
        .map(|(key, _)| key.clone())
}
