//! Loop orchestrator: ties the socket set, waiter, receive path, send
//! drain and migration-test hooks into the three public entry points.

use crate::dual::DualShared;
use crate::engine::{Engine, LoopCallback, LoopEvent};
use crate::error::{LoopError, Result};
use crate::receive::{handle_datagram, handle_handoff_datagram, ReceiveState};
use crate::send::{after_send, drain, DrainOutcome};
use crate::socket::SocketSet;
use crate::telemetry;
use crate::types::Family;
use crate::waiter::{wait, WaitOutcome};
use log::{debug, info};
use std::sync::Arc;

/// In-code configuration for one loop instance, in place of a CLI/file
/// loader: port, address family and outbound interface hint.
#[derive(Copy, Clone, Debug)]
pub struct LoopConfig {
    pub local_port: u16,
    pub family: Family,
    pub dest_if: i32,
}

impl LoopConfig {
    pub fn new(local_port: u16, family: Family) -> LoopConfig {
        LoopConfig { local_port, family, dest_if: 0 }
    }
}

const HOT_SPIN_THRESHOLD: u64 = 100;

struct HotSpinTracker {
    nb_loops: u64,
    window_start_us: u64,
}

impl HotSpinTracker {
    fn new(now_us: u64) -> HotSpinTracker {
        HotSpinTracker { nb_loops: 0, window_start_us: now_us }
    }

    /// Every 100 iterations with no intervening successful send, emit
    /// exactly one diagnostic and reset.
    fn tick(&mut self, sent_any: bool, now_us: u64) {
        if sent_any {
            self.nb_loops = 0;
            self.window_start_us = now_us;
            return;
        }
        self.nb_loops += 1;
        if self.nb_loops >= HOT_SPIN_THRESHOLD {
            let elapsed = now_us.saturating_sub(self.window_start_us);
            debug!("{} iterations without a send, {} us elapsed", self.nb_loops, elapsed);
            telemetry::HOT_SPIN_EVENTS_TOTAL.inc();
            telemetry::update_memory_usage();
            self.nb_loops = 0;
            self.window_start_us = now_us;
        }
    }
}

/// Single-engine entry point. Blocks until the callback or engine requests
/// termination, or a fatal receive I/O error occurs.
pub fn run_loop(
    engine: &mut dyn Engine,
    config: LoopConfig,
    callback: &mut dyn LoopCallback,
) -> Result<i32> {
    let mut sockets = SocketSet::open(config.local_port, config.family)?;
    let mut state = ReceiveState::new();
    let mut hot_spin = HotSpinTracker::new(0);

    let ready_rc = callback.on_event(LoopEvent::Ready, 0);
    if ready_rc != 0 {
        sockets.close_all();
        return Ok(ready_rc);
    }

    loop {
        let timeout_us = engine.next_wake_delay(0).unwrap_or(crate::types::MAX_WAIT_US);
        match wait(&sockets, timeout_us) {
            WaitOutcome::FatalIo(e) => {
                sockets.close_all();
                return Err(LoopError::Io(e));
            }
            WaitOutcome::Timeout { now_us } => {
                if let Some(rc) = run_drain_and_test(engine, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                hot_spin.tick(false, now_us);
            }
            WaitOutcome::Datagram(mut datagram) => {
                let now_us = datagram.arrival_time_us;
                if let Some(rc) = handle_datagram(&mut datagram, &mut state, &sockets, engine, callback, None) {
                    sockets.close_all();
                    return Ok(normalize_exit(rc));
                }
                if let Some(rc) = run_drain_and_test(engine, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                hot_spin.tick(true, now_us);
            }
        }
    }
}

/// Runs the drain pass, applies any migration-test signal, and invokes the
/// `AFTER_SEND` callback. Returns `Some(exit_code)` when the loop should
/// stop, already normalized.
fn run_drain_and_test(
    engine: &mut dyn Engine,
    sockets: &mut SocketSet,
    state: &mut ReceiveState,
    callback: &mut dyn LoopCallback,
    now_us: u64,
) -> Result<Option<i32>> {
    match drain(engine, sockets, state, now_us) {
        DrainOutcome::Terminate(rc) => return Ok(Some(normalize_exit(rc))),
        DrainOutcome::MigrationTest(signal, last_cnx) => {
            crate::migration_test::apply(signal, last_cnx, sockets, state, engine, now_us);
        }
        DrainOutcome::Ok { .. } => {}
    }
    if let Some(rc) = after_send(callback, now_us) {
        return Ok(Some(normalize_exit(rc)));
    }
    Ok(None)
}

fn normalize_exit(rc: i32) -> i32 {
    if rc == crate::engine::TERMINATE_PACKET_LOOP {
        0
    } else {
        rc
    }
}

/// Primary side of the dual-engine entry point: runs the full orchestrator,
/// routing datagrams owned by the backup through `shared` instead of
/// submitting them locally, and performing the migration handoff when the
/// primary's current connection raises it.
pub fn run_loop_dual_primary(
    primary: &mut dyn Engine,
    backup: &mut dyn Engine,
    shared: Arc<DualShared>,
    config: LoopConfig,
    callback: &mut dyn LoopCallback,
) -> Result<i32> {
    let mut sockets = SocketSet::open(config.local_port, config.family)?;
    let mut state = ReceiveState::new();
    let mut hot_spin = HotSpinTracker::new(0);

    let ready_rc = callback.on_event(LoopEvent::Ready, 0);
    if ready_rc != 0 {
        sockets.close_all();
        return Ok(ready_rc);
    }

    loop {
        let timeout_us = primary.next_wake_delay(0).unwrap_or(crate::types::MAX_WAIT_US);
        match wait(&sockets, timeout_us) {
            WaitOutcome::FatalIo(e) => {
                sockets.close_all();
                return Err(LoopError::Io(e));
            }
            WaitOutcome::Timeout { now_us } => {
                crate::dual::maybe_migrate(primary, backup, &shared);
                if let Some(rc) = run_drain_and_test(primary, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                hot_spin.tick(false, now_us);
            }
            WaitOutcome::Datagram(mut datagram) => {
                let now_us = datagram.arrival_time_us;
                crate::dual::maybe_migrate(primary, backup, &shared);
                if let Some(rc) =
                    handle_datagram(&mut datagram, &mut state, &sockets, primary, callback, Some(&*shared))
                {
                    sockets.close_all();
                    return Ok(normalize_exit(rc));
                }
                if let Some(rc) = run_drain_and_test(primary, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                hot_spin.tick(true, now_us);
            }
        }
    }
}

/// Backup side of the dual-engine entry point: no socket wait, instead
/// blocks on the handoff slot; runs the identical receive/drain pipeline
/// against its own engine and its own sockets.
pub fn run_loop_dual_backup(
    backup: &mut dyn Engine,
    shared: Arc<DualShared>,
    config: LoopConfig,
    callback: &mut dyn LoopCallback,
) -> Result<i32> {
    let mut sockets = SocketSet::open(config.local_port, config.family)?;
    let mut state = ReceiveState::new();

    let ready_rc = callback.on_event(LoopEvent::Ready, 0);
    if ready_rc != 0 {
        sockets.close_all();
        return Ok(ready_rc);
    }

    loop {
        if let Some(rc) = handle_handoff_datagram(&shared.slot, backup, callback) {
            sockets.close_all();
            return Ok(normalize_exit(rc));
        }
        let now_us = 0;
        if let Some(rc) = run_drain_and_test(backup, &mut sockets, &mut state, callback, now_us)? {
            sockets.close_all();
            return Ok(rc);
        }
    }
}

/// Migration-test harness entry point: runs the single-engine loop against
/// `engine_a`, and after exactly 100 drain iterations, migrates the first
/// connection onto `engine_b` once.
pub fn run_loop_test_migration(
    engine_a: &mut dyn Engine,
    engine_b: &mut dyn Engine,
    config: LoopConfig,
    callback: &mut dyn LoopCallback,
) -> Result<i32> {
    let mut sockets = SocketSet::open(config.local_port, config.family)?;
    let mut state = ReceiveState::new();
    let mut drain_iterations: u64 = 0;
    let mut migrated = false;

    let ready_rc = callback.on_event(LoopEvent::Ready, 0);
    if ready_rc != 0 {
        sockets.close_all();
        return Ok(ready_rc);
    }

    loop {
        let timeout_us = engine_a.next_wake_delay(0).unwrap_or(crate::types::MAX_WAIT_US);
        match wait(&sockets, timeout_us) {
            WaitOutcome::FatalIo(e) => {
                sockets.close_all();
                return Err(LoopError::Io(e));
            }
            WaitOutcome::Timeout { now_us } => {
                if let Some(rc) = run_drain_and_test(engine_a, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                drain_iterations += 1;
            }
            WaitOutcome::Datagram(mut datagram) => {
                let now_us = datagram.arrival_time_us;
                if let Some(rc) = handle_datagram(&mut datagram, &mut state, &sockets, engine_a, callback, None)
                {
                    sockets.close_all();
                    return Ok(normalize_exit(rc));
                }
                if let Some(rc) = run_drain_and_test(engine_a, &mut sockets, &mut state, callback, now_us)? {
                    sockets.close_all();
                    return Ok(rc);
                }
                drain_iterations += 1;
            }
        }

        if !migrated && drain_iterations == 100 {
            if let Err(e) = engine_a.migrate(engine_b) {
                log::warn!("migration-test harness migrate failed: {}", e);
            } else {
                info!("migration-test harness: migrated after 100 iterations");
            }
            migrated = true;
        }
    }
}
