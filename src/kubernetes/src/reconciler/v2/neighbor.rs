use std::net::IpAddr;

use bgpcp_bgp::peer::Neighbor;

use crate::{
    crd::{
        error::Error as CrdError,
        node_config::CiliumBGPNodePeer,
        peer_config::{ebgp_multihop, peer_port, CiliumBGPPeerConfig},
    },
    reconciler::{
        common::{global, peer_errors, validate_asn},
        InstanceState, ResourceError, StageResult, KIND_PEER, KIND_PEER_CONFIG,
    },
    util::parse_peer_address,
};

use super::V2Input;

pub(crate) fn to_neighbor(
    peer: &CiliumBGPNodePeer,
    address: IpAddr,
    config: Option<&CiliumBGPPeerConfig>,
) -> Result<Neighbor, CrdError> {
    let peer_asn = peer
        .peer_asn
        .ok_or(CrdError::MissingField("peerASN"))
        .and_then(validate_asn)?;
    let mut neighbor = Neighbor::new(&peer.name, address, peer_asn);
    let spec = match config {
        Some(config) => &config.spec,
        None => return Ok(neighbor),
    };
    neighbor.peer_port = peer_port(spec.transport.as_ref().and_then(|t| t.peer_port))?;
    neighbor.ebgp_multihop = ebgp_multihop(spec.ebgp_multihop)?;
    if let Some(timers) = &spec.timers {
        neighbor.timers = timers.to_timers()?;
    }
    if let Some(gr) = &spec.graceful_restart {
        neighbor.graceful_restart = gr.to_graceful_restart()?;
    }
    if let Some(families) = &spec.families {
        neighbor.families = families
            .iter()
            .map(|f| f.to_family())
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(neighbor)
}

pub(super) async fn reconcile(input: &V2Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let snapshot = input.snapshot.as_ref();
    let current = input.manager.router(global.asn);
    let keep = |addr: IpAddr| {
        current
            .as_ref()
            .and_then(|r| r.neighbors.get(&addr).cloned())
    };

    state.not_ready_peers.clear();
    let mut errors = Vec::new();
    let mut desired = Vec::new();
    for peer in input.instance.peers.iter().flatten() {
        let address = match peer.peer_address.as_deref().and_then(parse_peer_address) {
            Some(addr) => addr,
            None => {
                tracing::debug!(peer = peer.name, "peer has no address, skipping");
                continue;
            }
        };

        let config = match &peer.peer_config_ref {
            Some(r) => match snapshot.peer_configs.get(&r.name) {
                Some(config) => Some(config.as_ref()),
                None => {
                    errors.push(ResourceError::config_invalid(
                        KIND_PEER_CONFIG,
                        &r.name,
                        format!("peer config not found, referenced by peer {}", peer.name),
                    ));
                    state.not_ready_peers.insert(peer.name.clone());
                    desired.extend(keep(address));
                    continue;
                }
            },
            None => None,
        };

        let mut neighbor = match to_neighbor(peer, address, config) {
            Ok(n) => n,
            Err(e) => {
                let row = match config {
                    Some(c) if !matches!(e, CrdError::InvalidAsn(_) | CrdError::MissingField(_)) => {
                        ResourceError::config_invalid(KIND_PEER_CONFIG, &c.metadata.name.clone().unwrap_or_default(), e)
                    }
                    _ => ResourceError::config_invalid(KIND_PEER, &peer.name, e),
                };
                errors.push(row);
                desired.extend(keep(address));
                continue;
            }
        };

        if let Some((config, secret_ref)) = config.and_then(|c| c.spec.auth_secret_ref.as_ref().map(|s| (c, s))) {
            match snapshot.auth_password(secret_ref) {
                Ok(password) => neighbor.auth_password = Some(password),
                Err(msg) => {
                    let name = config.metadata.name.clone().unwrap_or_default();
                    tracing::warn!(peer = peer.name, peer_config = name, "{}", msg);
                    errors.push(ResourceError::config_invalid(KIND_PEER_CONFIG, &name, msg));
                    state.not_ready_peers.insert(peer.name.clone());
                    desired.extend(keep(address));
                    continue;
                }
            }
        }
        desired.push(neighbor);
    }

    if let Err(e) = input.manager.configure_peers(&global, &desired).await {
        let names: Vec<(IpAddr, String)> = desired.iter().map(|n| (n.address, n.name.clone())).collect();
        errors.extend(peer_errors(&e, global.asn, |addr| {
            names
                .iter()
                .find(|(a, _)| *a == addr)
                .map(|(_, n)| n.clone())
                .unwrap_or_else(|| addr.to_string())
        })?);
    }
    Ok(errors)
}
