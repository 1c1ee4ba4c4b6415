use std::net::IpAddr;

use bgpcp_bgp::peer::Neighbor;

use crate::{
    crd::{
        error::Error as CrdError,
        peer_config::{ebgp_multihop, peer_port, CiliumBGPTimers},
        peering_policy::CiliumBGPNeighbor,
    },
    reconciler::{
        common::{global, peer_errors, validate_asn},
        InstanceState, ResourceError, StageResult, KIND_PEERING_POLICY, KIND_SECRET,
    },
    util::parse_peer_address,
};

use super::V1Input;

pub(crate) fn to_neighbor(neighbor: &CiliumBGPNeighbor) -> Result<Neighbor, CrdError> {
    let address = parse_peer_address(&neighbor.peer_address)
        .ok_or_else(|| CrdError::InvalidPeerAddress(neighbor.peer_address.clone()))?;
    let peer_asn = validate_asn(neighbor.peer_asn)?;

    let mut peer = Neighbor::new(&address.to_string(), address, peer_asn);
    peer.peer_port = peer_port(neighbor.peer_port)?;
    peer.ebgp_multihop = ebgp_multihop(neighbor.ebgp_multihop_ttl)?;
    peer.timers = CiliumBGPTimers {
        connect_retry_time_seconds: neighbor.connect_retry_time_seconds,
        hold_time_seconds: neighbor.hold_time_seconds,
        keep_alive_time_seconds: neighbor.keep_alive_time_seconds,
    }
    .to_timers()?;
    if let Some(gr) = &neighbor.graceful_restart {
        peer.graceful_restart = gr.to_graceful_restart()?;
    }
    if let Some(families) = &neighbor.families {
        peer.families = families
            .iter()
            .map(|f| f.to_family())
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(peer)
}

pub(super) async fn reconcile(input: &V1Input, state: &mut InstanceState) -> StageResult {
    let global = global(state)?;
    let current = input.manager.router(global.asn);
    // A peer whose desired configuration cannot be computed keeps running
    // with what it has.
    let keep = |addr: IpAddr| {
        current
            .as_ref()
            .and_then(|r| r.neighbors.get(&addr).cloned())
    };

    let mut errors = Vec::new();
    let mut desired = Vec::new();
    for neighbor in input.router.neighbors.iter() {
        let mut peer = match to_neighbor(neighbor) {
            Ok(peer) => peer,
            Err(e) => {
                errors.push(ResourceError::config_invalid(
                    KIND_PEERING_POLICY,
                    &input.policy_name,
                    format!("neighbor {}: {}", neighbor.peer_address, e),
                ));
                desired.extend(parse_peer_address(&neighbor.peer_address).and_then(keep));
                continue;
            }
        };
        if let Some(secret_ref) = &neighbor.auth_secret_ref {
            match input.snapshot.auth_password(secret_ref) {
                Ok(password) => peer.auth_password = Some(password),
                Err(msg) => {
                    tracing::warn!(peer = %peer.address, secret = secret_ref, "{}", msg);
                    errors.push(ResourceError::config_invalid(KIND_SECRET, secret_ref, msg));
                    desired.extend(keep(peer.address));
                    continue;
                }
            }
        }
        desired.push(peer);
    }

    if let Err(e) = input.manager.configure_peers(&global, &desired).await {
        errors.extend(peer_errors(&e, global.asn, |addr| addr.to_string())?);
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::fixture::reconciler::neighbor;

    #[rstest(
        update,
        ok,
        case(|_: &mut CiliumBGPNeighbor| {}, true),
        case(|n: &mut CiliumBGPNeighbor| n.hold_time_seconds = Some(30), true),
        case(|n: &mut CiliumBGPNeighbor| { n.hold_time_seconds = Some(9); n.keep_alive_time_seconds = Some(10) }, false),
        case(|n: &mut CiliumBGPNeighbor| n.peer_port = Some(0), false),
        case(|n: &mut CiliumBGPNeighbor| n.ebgp_multihop_ttl = Some(256), false),
        case(|n: &mut CiliumBGPNeighbor| n.peer_asn = 0, false),
        case(|n: &mut CiliumBGPNeighbor| n.peer_address = "10.0.0.0/24".to_string(), false)
    )]
    fn test_to_neighbor(update: fn(&mut CiliumBGPNeighbor), ok: bool) {
        let mut n = neighbor("10.0.0.1", 65002);
        update(&mut n);
        assert_eq!(ok, to_neighbor(&n).is_ok());
    }

    #[test]
    fn test_to_neighbor_defaults() {
        let peer = to_neighbor(&neighbor("10.0.0.1/32", 65002)).unwrap();
        assert_eq!("10.0.0.1", peer.name);
        assert_eq!(179, peer.peer_port);
        assert_eq!(90, peer.timers.hold_time_secs);
        assert_eq!(1, peer.ebgp_multihop);
    }
}
