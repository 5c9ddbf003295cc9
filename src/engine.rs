//! Contracts the loop drives but never implements itself: the QUIC protocol
//! engine (crypto, congestion control, stream layer) and the application's
//! loop callback.
//!
//! The loop treats the engine as a black box exposing a next-wake-delay
//! query, incoming/outgoing packet hooks, a path prober, an
//! unreachable-destination notifier, and enough connection introspection
//! to drive the dual-engine handoff (`server_flag`, `migration_flag`,
//! `shallow_migrate`).

use crate::types::{ConnectionHandle, Datagram, PreparedPacket};
use std::net::SocketAddr;

/// Loop-terminating / pseudo-error return codes an [`Engine`] preparer or a
/// [`LoopCallback`] may hand back.
pub const TERMINATE_PACKET_LOOP: i32 = 0x7fff_0001;
pub const SIMULATE_NAT: i32 = 0x7fff_0002;
pub const SIMULATE_MIGRATION: i32 = 0x7fff_0003;

/// A snapshot of the bits the loop needs to read off a connection to decide
/// whether it should be handed off to the backup engine.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConnectionFlags {
    pub server_flag: bool,
    pub migration_flag: bool,
}

/// The QUIC protocol engine, as seen by the packet loop.
///
/// Implementations own connection state, cryptographic material and
/// scheduling; the loop only ever calls the handful of methods below.
pub trait Engine {
    /// Microseconds until the engine next wants attention, for the waiter's
    /// timeout. `None` means "no opinion", which the loop caps to
    /// [`crate::types::MAX_WAIT_US`] regardless.
    fn next_wake_delay(&self, now_us: u64) -> Option<i64>;

    /// Hands one received datagram to the engine for decryption/processing.
    fn incoming_packet(&mut self, datagram: &Datagram) -> Result<(), String>;

    /// Asks the engine for the next outbound datagram. `Ok(None)` means the
    /// engine has nothing left to send this drain pass. `Err` carries a
    /// preparer return code: either a fatal message, or one of
    /// [`TERMINATE_PACKET_LOOP`]/[`SIMULATE_NAT`]/[`SIMULATE_MIGRATION`]
    /// smuggled through [`PreparerSignal`].
    fn prepare_next_packet(&mut self, now_us: u64) -> Result<Option<PreparedPacket>, PreparerSignal>;

    /// Requests a new path probe over `new_local_addr` for the connection
    /// identified by `handle`, towards `peer_addr`.
    fn probe_new_path(
        &mut self,
        handle: ConnectionHandle,
        peer_addr: SocketAddr,
        new_local_addr: SocketAddr,
        now_us: u64,
    ) -> Result<(), String>;

    /// Informs the engine that a send to `peer_addr` came back as
    /// unreachable, so the affected path can be marked dead.
    fn notify_destination_unreachable(
        &mut self,
        handle: Option<ConnectionHandle>,
        now_us: u64,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        if_index: i32,
        os_error: i32,
    );

    /// The first connection the engine knows about, if any. Used only to
    /// read flags and address pairs for the dual-engine handoff check.
    fn first_connection(&self) -> Option<ConnectionHandle>;

    fn connection_flags(&self, handle: ConnectionHandle) -> Option<ConnectionFlags>;

    fn clear_migration_flag(&mut self, handle: ConnectionHandle);

    fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr>;

    /// The connection's current local address, for picking the address
    /// family of a new probe path under simulated migration.
    fn local_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr>;

    /// Relocates the connection's live state into `backup` without
    /// renegotiating QUIC crypto. After a successful call, `backup` owns the
    /// connection and `self` no longer does.
    fn shallow_migrate(&mut self, handle: ConnectionHandle, backup: &mut dyn Engine) -> Result<(), String>;

    /// Full migration: moves this engine's first connection onto `new_engine`
    /// wholesale, used by the migration-test harness.
    fn migrate(&mut self, new_engine: &mut dyn Engine) -> Result<(), String>;

    /// Recovers the concrete type behind this trait object, for the one
    /// spot (`shallow_migrate`) that needs to reach into another engine's
    /// private connection table rather than go through the trait surface.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Non-fatal signals a preparer can raise instead of a hard error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreparerSignal {
    Terminate,
    SimulateNat,
    SimulateMigration,
    Fatal,
}

impl PreparerSignal {
    pub fn from_code(code: i32) -> PreparerSignal {
        match code {
            TERMINATE_PACKET_LOOP => PreparerSignal::Terminate,
            SIMULATE_NAT => PreparerSignal::SimulateNat,
            SIMULATE_MIGRATION => PreparerSignal::SimulateMigration,
            _ => PreparerSignal::Fatal,
        }
    }
}

/// Events the loop reports to the application-supplied [`LoopCallback`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopEvent {
    Ready,
    AfterReceive,
    AfterSend,
}

/// The application hook invoked at three points: once before entering the
/// loop, and after every receive/send pass.
///
/// A non-zero return terminates the loop, propagated as the loop's final
/// exit code (normalised through [`TERMINATE_PACKET_LOOP`]).
pub trait LoopCallback {
    fn on_event(&mut self, event: LoopEvent, now_us: u64) -> i32;
}

/// A callback that never asks for termination; handy for demos and tests
/// that only care about the loop's side effects.
pub struct NoopCallback;

impl LoopCallback for NoopCallback {
    fn on_event(&mut self, _event: LoopEvent, _now_us: u64) -> i32 {
        0
    }
}
