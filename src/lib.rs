//! QUIC-aware UDP packet loop with dual-engine connection migration handoff.
//!
//! The loop drives one or two UDP sockets, feeds received datagrams into a
//! QUIC [`engine::Engine`], drains its outbound queue, and, in dual-engine
//! mode, hands a connection's traffic over from a primary engine to a
//! backup one on a live signal. A second mode exercises transport-level
//! migration tests (simulated NAT rebind, simulated path migration).

pub mod dual;
pub mod engine;
pub mod error;
pub mod logging;
pub mod migration_test;
pub mod quiche_engine;
pub mod receive;
pub mod run_loop;
pub mod send;
pub mod socket;
pub mod sockopt;
pub mod telemetry;
pub mod types;
pub mod waiter;

pub use engine::{Engine, LoopCallback, LoopEvent, NoopCallback};
pub use error::{LoopError, Result};
pub use run_loop::{run_loop, run_loop_dual_backup, run_loop_dual_primary, run_loop_test_migration, LoopConfig};
pub use types::{ConnectionHandle, Datagram, Family, PreparedPacket};
