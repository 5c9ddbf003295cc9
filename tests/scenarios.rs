//! End-to-end scenario tests against a deterministic mock engine and real
//! loopback UDP sockets, covering socket lifecycle, migration-test hooks
//! and the dual-engine handoff.

use quicloop::dual::{maybe_migrate, DualShared};
use quicloop::engine::{ConnectionFlags, Engine, PreparerSignal};
use quicloop::receive::{handle_datagram, ReceiveState};
use quicloop::socket::SocketSet;
use quicloop::types::{ConnectionHandle, Datagram, Family, PreparedPacket};
use quicloop::waiter::{wait, WaitOutcome};
use quicloop::NoopCallback;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// A deterministic [`Engine`] stand-in: records every datagram handed to
/// `incoming_packet`, replays a scripted queue of outbound packets/signals,
/// and tracks how many times each hook fired.
struct MockEngine {
    received: Vec<Datagram>,
    outbound: VecDeque<Result<Option<PreparedPacket>, PreparerSignal>>,
    handle: ConnectionHandle,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    flags: ConnectionFlags,
    probe_calls: u32,
    migrated: bool,
}

impl MockEngine {
    fn new() -> MockEngine {
        MockEngine {
            received: Vec::new(),
            outbound: VecDeque::new(),
            handle: ConnectionHandle(1),
            peer: None,
            local: None,
            flags: ConnectionFlags::default(),
            probe_calls: 0,
            migrated: false,
        }
    }
}

impl Engine for MockEngine {
    fn next_wake_delay(&self, _now_us: u64) -> Option<i64> {
        None
    }

    fn incoming_packet(&mut self, datagram: &Datagram) -> Result<(), String> {
        self.received.push(datagram.clone());
        Ok(())
    }

    fn prepare_next_packet(&mut self, _now_us: u64) -> Result<Option<PreparedPacket>, PreparerSignal> {
        match self.outbound.pop_front() {
            Some(result) => result,
            None => Ok(None),
        }
    }

    fn probe_new_path(
        &mut self,
        _handle: ConnectionHandle,
        _peer_addr: SocketAddr,
        _new_local_addr: SocketAddr,
        _now_us: u64,
    ) -> Result<(), String> {
        self.probe_calls += 1;
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
        self.peer.map(|_| self.handle)
    }

    fn connection_flags(&self, handle: ConnectionHandle) -> Option<ConnectionFlags> {
        if handle == self.handle {
            Some(self.flags)
        } else {
            None
        }
    }

    fn clear_migration_flag(&mut self, handle: ConnectionHandle) {
        if handle == self.handle {
            self.flags.migration_flag = false;
        }
    }

    fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        if handle == self.handle {
            self.peer
        } else {
            None
        }
    }

    fn local_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        if handle == self.handle {
            self.local
        } else {
            None
        }
    }

    fn shallow_migrate(&mut self, handle: ConnectionHandle, _backup: &mut dyn Engine) -> Result<(), String> {
        if handle != self.handle {
            return Err("unknown handle".to_string());
        }
        if self.migrated {
            return Err("already migrated".to_string());
        }
        self.migrated = true;
        Ok(())
    }

    fn migrate(&mut self, backup: &mut dyn Engine) -> Result<(), String> {
        self.shallow_migrate(self.handle, backup)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn mk_datagram(from: SocketAddr, to: SocketAddr, rank: usize) -> Datagram {
    Datagram {
        bytes: vec![0u8; 12],
        addr_from: from,
        addr_to: to,
        if_index_to: 0,
        ecn: 0,
        socket_rank: rank,
        arrival_time_us: 0,
    }
}

/// S1. Single UDP echo, single family: `local_port = 0`, inject a datagram,
/// expect the port to latch and the receive path to see the bound port.
#[test]
fn s1_single_echo_latches_port() {
    let sockets = SocketSet::open(0, Family::V4).expect("open");
    let bound_port = sockets.local_port_of(0).expect("local port");

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", bound_port).parse().unwrap();
    sender.send_to(b"hello, world", target).unwrap();

    let outcome = wait(&sockets, 2_000_000);
    let mut datagram = match outcome {
        WaitOutcome::Datagram(d) => d,
        WaitOutcome::Timeout { .. } => panic!("expected a datagram, got a timeout"),
        WaitOutcome::FatalIo(e) => panic!("fatal io: {}", e),
    };

    let mut state = ReceiveState::new();
    let mut engine = MockEngine::new();
    let mut callback = NoopCallback;

    let rc = handle_datagram(&mut datagram, &mut state, &sockets, &mut engine, &mut callback, None);
    assert!(rc.is_none());
    assert_eq!(state.socket_port, bound_port);
    assert_eq!(engine.received.len(), 1);
    assert_eq!(engine.received[0].addr_to.port(), bound_port);
}

/// S2. Dual-stack open: expect exactly 2 sockets, rank 0 = IPv4, rank 1 = IPv6.
#[test]
fn s2_dual_stack_open() {
    let sockets = SocketSet::open(4433, Family::Unspec).expect("open");
    assert_eq!(sockets.len(), 2);
    assert_eq!(sockets.slots()[0].family, Family::V4);
    assert_eq!(sockets.slots()[1].family, Family::V6);
}

/// S3. Partial open failure: pre-bind the IPv6 side of a port so the second
/// socket in the UNSPEC open fails, expect the whole set to roll back.
#[test]
fn s3_partial_open_failure_rolls_back() {
    let blocker = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None).unwrap();
    let addr: SocketAddr = "[::]:4545".parse().unwrap();
    blocker.bind(&addr.into()).unwrap();

    let result = SocketSet::open(4545, Family::Unspec);
    assert!(result.is_err(), "expected the dual-stack open to fail");
}

/// S4. Simulated NAT: the home socket is replaced by a fresh one.
#[test]
fn s4_simulated_nat_replaces_home_socket() {
    let mut sockets = SocketSet::open(0, Family::V4).expect("open");
    let old_port = sockets.local_port_of(0).unwrap();
    let mut state = ReceiveState::new();
    let mut engine = MockEngine::new();

    quicloop::migration_test::apply(
        PreparerSignal::SimulateNat,
        None,
        &mut sockets,
        &mut state,
        &mut engine,
        0,
    );

    assert_eq!(sockets.len(), 1);
    let new_port = sockets.local_port_of(0).unwrap();
    assert_ne!(old_port, new_port, "NAT rebind should pick a new ephemeral port");
}

/// S5. Simulated migration + probe: a new socket is appended,
/// `testing_migration` becomes true, and `probe_new_path` fires once.
#[test]
fn s5_simulated_migration_probes_new_path() {
    let mut sockets = SocketSet::open(4433, Family::V4).expect("open");
    let mut state = ReceiveState::new();
    state.socket_port = 4433;
    let mut engine = MockEngine::new();
    engine.peer = Some("10.0.0.5:9000".parse().unwrap());
    engine.local = Some("0.0.0.0:4433".parse().unwrap());

    quicloop::migration_test::apply(
        PreparerSignal::SimulateMigration,
        Some(ConnectionHandle(1)),
        &mut sockets,
        &mut state,
        &mut engine,
        0,
    );

    assert_eq!(sockets.len(), 2);
    assert!(state.testing_migration);
    assert_eq!(state.next_port, 4434);
    assert_eq!(engine.probe_calls, 1);
}

/// S6. Dual-engine handoff: migration trigger on the primary inserts the
/// ownership key; the next datagram from that peer is routed through the
/// handoff slot and observed by the backup thread.
#[test]
fn s6_dual_engine_handoff() {
    let shared = Arc::new(DualShared::new());
    let mut primary = MockEngine::new();
    let mut backup = MockEngine::new();

    let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
    primary.peer = Some(peer);
    primary.flags = ConnectionFlags { server_flag: true, migration_flag: true };

    let migrated_peer = maybe_migrate(&mut primary, &mut backup, &shared);
    assert_eq!(migrated_peer, Some(peer));
    assert!(shared.table.contains(&peer));
    assert!(primary.migrated);
    assert!(!primary.flags.migration_flag);

    let local: SocketAddr = "10.0.0.2:4433".parse().unwrap();
    let mut datagram = mk_datagram(peer, local, 0);

    let sockets = SocketSet::open(0, Family::V4).expect("open");
    let mut state = ReceiveState::new();
    let mut callback = NoopCallback;

    let shared_for_thread = Arc::clone(&shared);
    let consumer = std::thread::spawn(move || shared_for_thread.slot.take_blocking());

    // Give the consumer thread a moment to start blocking on the condvar.
    std::thread::sleep(Duration::from_millis(20));

    let rc = handle_datagram(&mut datagram, &mut state, &sockets, &mut primary, &mut callback, Some(&*shared));
    assert!(rc.is_none());
    assert!(primary.received.is_empty(), "datagram should be routed to the backup, not processed locally");

    let observed = consumer.join().unwrap();
    assert_eq!(observed.addr_from, peer);
    assert_eq!(observed.addr_to, local);
}
