//! Receive path: local port latching, port relabelling under
//! migration-test mode, ownership-table routing, and submission to the
//! owning engine.

use crate::dual::{DualShared, HandoffSlot};
use crate::engine::{Engine, LoopCallback, LoopEvent};
use crate::socket::SocketSet;
use crate::telemetry;
use crate::types::Datagram;
use log::{debug, warn};

/// Mutable loop state the receive path reads and latches into.
pub struct ReceiveState {
    pub socket_port: u16,
    pub testing_migration: bool,
    pub next_port: u16,
}

impl ReceiveState {
    pub fn new() -> ReceiveState {
        ReceiveState { socket_port: 0, testing_migration: false, next_port: 0 }
    }
}

/// Runs steps 1–4 of the receive path against a single-engine (or primary)
/// loop. Returns the non-zero callback return code, if any, as a request to
/// terminate the loop.
pub fn handle_datagram(
    datagram: &mut Datagram,
    state: &mut ReceiveState,
    sockets: &SocketSet,
    engine: &mut dyn Engine,
    callback: &mut dyn LoopCallback,
    dual: Option<&DualShared>,
) -> Option<i32> {
    // 1. Learn local port.
    if state.socket_port == 0 && sockets.len() == 1 {
        match sockets.local_port_of(0) {
            Ok(port) => {
                state.socket_port = port;
                debug!("latched local port {}", port);
            }
            Err(e) => {
                warn!("could not read back local address: {}", e);
            }
        }
    }

    // 2. Relabel port under testing_migration.
    if state.testing_migration {
        let port = if datagram.socket_rank == 0 { state.socket_port } else { state.next_port };
        datagram.addr_to.set_port(port);
    }

    // 3. Route: ownership check (dual-engine only), then submit.
    if let Some(dual) = dual {
        if dual.table.contains(&datagram.addr_from) {
            dual.slot.publish(datagram.clone());
            telemetry::PACKETS_RECEIVED_TOTAL.inc();
            return after_receive(callback, datagram.arrival_time_us);
        }
    }

    if let Err(e) = engine.incoming_packet(datagram) {
        warn!("incoming_packet failed: {}", e);
    }
    telemetry::PACKETS_RECEIVED_TOTAL.inc();

    after_receive(callback, datagram.arrival_time_us)
}

fn after_receive(callback: &mut dyn LoopCallback, now_us: u64) -> Option<i32> {
    let rc = callback.on_event(LoopEvent::AfterReceive, now_us);
    if rc != 0 {
        Some(rc)
    } else {
        None
    }
}

/// The backup side of the handoff: blocks until a datagram is published,
/// then runs the identical routing/submission step against its own engine.
/// No ownership check here: every datagram the backup sees is already
/// known to belong to it.
pub fn handle_handoff_datagram(
    slot: &HandoffSlot,
    engine: &mut dyn Engine,
    callback: &mut dyn LoopCallback,
) -> Option<i32> {
    let datagram = slot.take_blocking();
    if let Err(e) = engine.incoming_packet(&datagram) {
        warn!("backup incoming_packet failed: {}", e);
    }
    telemetry::PACKETS_RECEIVED_TOTAL.inc();
    after_receive(callback, datagram.arrival_time_us)
}
