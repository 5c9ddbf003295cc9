//! Migration-test hooks: `SIMULATE_NAT` swaps the home socket for a
//! fresh one on a new ephemeral port; `SIMULATE_MIGRATION` appends a second
//! socket and probes a new path over it.

use crate::engine::{Engine, PreparerSignal};
use crate::receive::ReceiveState;
use crate::socket::SocketSet;
use crate::types::{ConnectionHandle, Family};
use log::{info, warn};
use std::net::SocketAddr;

/// Applies the effect of a migration-test signal returned from the drain
/// loop, then lets the outer loop resume on the next iteration. Socket-open
/// failure here is soft: logged against `last_cnx` and otherwise ignored.
pub fn apply(
    signal: PreparerSignal,
    last_cnx: Option<ConnectionHandle>,
    sockets: &mut SocketSet,
    state: &mut ReceiveState,
    engine: &mut dyn Engine,
    now_us: u64,
) {
    match signal {
        PreparerSignal::SimulateNat => apply_nat(sockets, last_cnx),
        PreparerSignal::SimulateMigration => apply_migration(sockets, state, engine, last_cnx, now_us),
        _ => {}
    }
}

fn apply_nat(sockets: &mut SocketSet, last_cnx: Option<ConnectionHandle>) {
    let family = sockets.get(0).map(|s| s.family).unwrap_or(Family::V4);
    match SocketSet::open_single(0, family) {
        Ok(new_slot) => {
            sockets.replace(0, new_slot);
            info!("simulated NAT rebind: socket 0 replaced");
        }
        Err(e) => {
            warn!("simulated NAT rebind failed (cnx {:?}): {}", last_cnx, e);
        }
    }
}

fn apply_migration(
    sockets: &mut SocketSet,
    state: &mut ReceiveState,
    engine: &mut dyn Engine,
    last_cnx: Option<ConnectionHandle>,
    now_us: u64,
) {
    let handle = match last_cnx {
        Some(h) => h,
        None => {
            warn!("simulated migration requested with no active connection, discarding");
            return;
        }
    };

    let new_port = state.socket_port + 1;
    let family = match engine.local_addr(handle) {
        Some(addr) => Family::of(&addr),
        None => {
            warn!("simulated migration: no local address for cnx {:?}, discarding", handle);
            return;
        }
    };

    let new_slot = match SocketSet::open_single(new_port, family) {
        Ok(s) => s,
        Err(e) => {
            warn!("simulated migration socket open failed (cnx {:?}): {}", handle, e);
            return;
        }
    };

    if !sockets.push(new_slot) {
        warn!("socket set has no room for migration-test socket, discarding");
        return;
    }

    state.testing_migration = true;
    state.next_port = new_port;

    let peer_addr = match engine.peer_addr(handle) {
        Some(p) => p,
        None => return,
    };
    let new_local_addr: SocketAddr = match family {
        Family::V4 => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), new_port),
        Family::V6 => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), new_port),
        Family::Unspec => return,
    };

    if let Err(e) = engine.probe_new_path(handle, peer_addr, new_local_addr, now_us) {
        warn!("probe_new_path failed: {}", e);
    } else {
        info!("simulated migration: probing new path at port {}", new_port);
    }
}
