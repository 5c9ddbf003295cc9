//! Send drain: repeatedly ask the engine for the next outbound
//! datagram, pick a send socket by family, transmit, and handle
//! unreachable-destination signalling.

use crate::engine::{Engine, LoopCallback, LoopEvent, PreparerSignal};
use crate::receive::ReceiveState;
use crate::socket::SocketSet;
use crate::telemetry;
use crate::types::{ConnectionHandle, Family};
use log::{debug, warn};

pub enum DrainOutcome {
    /// Drain completed normally; `sent_any` feeds the hot-spin reset rule.
    Ok { sent_any: bool },
    /// The engine/callback asked the loop to stop, carrying the exit code.
    Terminate(i32),
    /// A migration-test pseudo-code fired; the caller handles it and resumes
    /// draining on the next outer-loop iteration.
    MigrationTest(PreparerSignal, Option<ConnectionHandle>),
}

/// Runs the full drain loop for one outer-loop iteration.
pub fn drain(
    engine: &mut dyn Engine,
    sockets: &SocketSet,
    state: &ReceiveState,
    now_us: u64,
) -> DrainOutcome {
    let mut sent_any = false;
    let mut last_cnx: Option<ConnectionHandle> = None;

    loop {
        let prepared = match engine.prepare_next_packet(now_us) {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(signal) => {
                return match signal {
                    PreparerSignal::Terminate => DrainOutcome::Terminate(0),
                    PreparerSignal::SimulateNat | PreparerSignal::SimulateMigration => {
                        DrainOutcome::MigrationTest(signal, last_cnx)
                    }
                    PreparerSignal::Fatal => DrainOutcome::Terminate(-1),
                };
            }
        };

        if prepared.send_len == 0 {
            break;
        }

        last_cnx = prepared.last_cnx.or(last_cnx);

        let peer_family = Family::of(&prepared.peer_addr);
        let mut rank = sockets.select_send_socket(peer_family);

        if state.testing_migration && prepared.local_addr.port() == state.next_port {
            rank = Some(sockets.len().saturating_sub(1));
        }

        let rank = match rank {
            Some(r) => r,
            None => {
                warn!("no send socket for family {:?}, dropping prepared packet", peer_family);
                telemetry::SEND_ERRORS_TOTAL.inc();
                continue;
            }
        };

        let slot = match sockets.get(rank) {
            Some(s) => s,
            None => continue,
        };

        match slot.socket.send_to(&prepared.buf[..prepared.send_len], &prepared.peer_addr.into()) {
            Ok(_) => {
                sent_any = true;
                telemetry::PACKETS_SENT_TOTAL.inc();
                debug!("sent {} bytes to {}", prepared.send_len, prepared.peer_addr);
            }
            Err(e) => {
                telemetry::SEND_ERRORS_TOTAL.inc();
                if let Some(code) = e.raw_os_error() {
                    warn!("send to {} failed (cid {:?}): {}", prepared.peer_addr, prepared.log_cid, e);
                    if is_unreachable(code) {
                        telemetry::DESTINATION_UNREACHABLE_TOTAL.inc();
                        engine.notify_destination_unreachable(
                            prepared.last_cnx,
                            now_us,
                            prepared.peer_addr,
                            prepared.local_addr,
                            prepared.if_index,
                            code,
                        );
                    }
                } else {
                    warn!("send to {} failed: {}", prepared.peer_addr, e);
                }
            }
        }
    }

    DrainOutcome::Ok { sent_any }
}

#[cfg(unix)]
fn is_unreachable(code: i32) -> bool {
    matches!(code, libc::ECONNREFUSED | libc::EHOSTUNREACH | libc::ENETUNREACH)
}

#[cfg(not(unix))]
fn is_unreachable(_code: i32) -> bool {
    false
}

/// Invokes the `AFTER_SEND` callback; a non-zero return requests loop exit.
pub fn after_send(callback: &mut dyn LoopCallback, now_us: u64) -> Option<i32> {
    let rc = callback.on_event(LoopEvent::AfterSend, now_us);
    if rc != 0 {
        Some(rc)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnectionFlags;
    use crate::types::PreparedPacket;
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    /// Replays a scripted sequence of `prepare_next_packet` results; used
    /// only to check that `drain` threads `last_cnx` through correctly.
    struct StubEngine {
        outbound: VecDeque<Result<Option<PreparedPacket>, PreparerSignal>>,
    }

    impl Engine for StubEngine {
        fn next_wake_delay(&self, _now_us: u64) -> Option<i64> {
            None
        }
        fn incoming_packet(&mut self, _datagram: &crate::types::Datagram) -> Result<(), String> {
            Ok(())
        }
        fn prepare_next_packet(&mut self, _now_us: u64) -> Result<Option<PreparedPacket>, PreparerSignal> {
            self.outbound.pop_front().unwrap_or(Ok(None))
        }
        fn probe_new_path(
            &mut self,
            _handle: ConnectionHandle,
            _peer_addr: SocketAddr,
            _new_local_addr: SocketAddr,
            _now_us: u64,
        ) -> Result<(), String> {
            Ok(())
        }
        fn notify_destination_unreachable(
            &mut self,
            _handle: Option<ConnectionHandle>,
            _now_us: u64,
            _peer_addr: SocketAddr,
            _local_addr: SocketAddr,
            _if_index: i32,
            _os_error: i32,
        ) {
        }
        fn first_connection(&self) -> Option<ConnectionHandle> {
            None
        }
        fn connection_flags(&self, _handle: ConnectionHandle) -> Option<ConnectionFlags> {
            None
        }
        fn clear_migration_flag(&mut self, _handle: ConnectionHandle) {}
        fn peer_addr(&self, _handle: ConnectionHandle) -> Option<SocketAddr> {
            None
        }
        fn local_addr(&self, _handle: ConnectionHandle) -> Option<SocketAddr> {
            None
        }
        fn shallow_migrate(&mut self, _handle: ConnectionHandle, _backup: &mut dyn Engine) -> Result<(), String> {
            Err("not supported".to_string())
        }
        fn migrate(&mut self, _new_engine: &mut dyn Engine) -> Result<(), String> {
            Err("not supported".to_string())
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn mk_packet(handle: ConnectionHandle) -> PreparedPacket {
        PreparedPacket {
            buf: vec![0u8; 4],
            send_len: 4,
            peer_addr: "10.0.0.1:5000".parse().unwrap(),
            local_addr: "0.0.0.0:4433".parse().unwrap(),
            if_index: 0,
            log_cid: Vec::new(),
            last_cnx: Some(handle),
        }
    }

    #[test]
    fn drain_carries_last_prepared_handle_into_migration_test() {
        let handle = ConnectionHandle(7);
        let mut engine = StubEngine {
            outbound: VecDeque::from(vec![
                Ok(Some(mk_packet(handle))),
                Err(PreparerSignal::SimulateMigration),
            ]),
        };
        let sockets = SocketSet::open(0, Family::V4).expect("open");
        let state = ReceiveState::new();

        match drain(&mut engine, &sockets, &state, 0) {
            DrainOutcome::MigrationTest(PreparerSignal::SimulateMigration, last_cnx) => {
                assert_eq!(last_cnx, Some(handle));
            }
            _ => panic!("expected a migration-test outcome carrying the last prepared handle"),
        }
    }
}
