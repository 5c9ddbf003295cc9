//! Dual-engine handoff: the connection ownership table and the
//! single-buffered producer/consumer slot that ferries a datagram from the
//! primary thread to the backup thread, plus the migration trigger check.
//!
//! Peer-text ownership lookup, mutex+condvar single-slot rendezvous,
//! shallow-migrate-then-insert-key sequence.

use crate::engine::Engine;
use crate::telemetry;
use crate::types::Datagram;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};

/// Peer-endpoint routing table: hit means "owned by the backup". Insert-only
/// for the lifetime of a session. Reads only ever happen from the primary
/// thread, so a plain mutex is sufficient; there is no concurrent reader to
/// race against.
pub struct OwnershipTable {
    keys: Mutex<HashSet<String>>,
}

impl OwnershipTable {
    pub fn new() -> OwnershipTable {
        OwnershipTable { keys: Mutex::new(HashSet::new()) }
    }

    /// The peer-address text key: `host:port`, family-aware via `SocketAddr`'s
    /// own `Display`. Coarse by design; see the collision caveat in
    /// `DESIGN.md` (two connections that share a 4-tuple alias to one key).
    pub fn key_for(addr: &SocketAddr) -> String {
        addr.to_string()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        let key = Self::key_for(addr);
        self.keys.lock().unwrap().contains(&key)
    }

    /// Returns `true` if this insert is the first for `addr`; callers use
    /// this to enforce "migrate at most once per connection".
    pub fn insert(&self, addr: &SocketAddr) -> bool {
        let key = Self::key_for(addr);
        let inserted = self.keys.lock().unwrap().insert(key);
        if inserted {
            telemetry::OWNERSHIP_TABLE_SIZE.set(self.keys.lock().unwrap().len() as i64);
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-element shared buffer. Overwrite-on-full by design: if the
/// backup is slow, the next publish drops the previously queued datagram
/// rather than blocking the primary. The capacity is pinned to one slot
/// here via a named constant rather than a hardcoded `Option`, so a future
/// bounded ring buffer is a local change.
pub const HANDOFF_SLOT_CAPACITY: usize = 1;

pub struct HandoffSlot {
    slot: Mutex<Option<Datagram>>,
    nonempty: Condvar,
}

impl HandoffSlot {
    pub fn new() -> HandoffSlot {
        HandoffSlot { slot: Mutex::new(None), nonempty: Condvar::new() }
    }

    /// Producer side: overwrite the slot and signal. Never blocks.
    pub fn publish(&self, datagram: Datagram) {
        let mut guard = self.slot.lock().unwrap();
        if guard.is_some() {
            // A previous datagram was never drained; it is lost by design.
        }
        *guard = Some(datagram);
        self.nonempty.notify_one();
    }

    /// Consumer side: block until a datagram is available, then take it.
    pub fn take_blocking(&self) -> Datagram {
        let mut guard = self.slot.lock().unwrap();
        loop {
            if let Some(dgram) = guard.take() {
                return dgram;
            }
            guard = self.nonempty.wait(guard).unwrap();
        }
    }
}

impl Default for HandoffSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// State the primary and backup threads share for one dual-engine session.
pub struct DualShared {
    pub table: OwnershipTable,
    pub slot: HandoffSlot,
}

impl DualShared {
    pub fn new() -> DualShared {
        DualShared { table: OwnershipTable::new(), slot: HandoffSlot::new() }
    }
}

impl Default for DualShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the primary's first connection for the migration trigger
/// (`server_flag && migration_flag`) and, if raised, performs the handoff:
/// clear the flag, shallow-migrate, insert the ownership key. Returns the
/// migrated connection's peer address on success, for logging/telemetry.
pub fn maybe_migrate(
    primary: &mut dyn Engine,
    backup: &mut dyn Engine,
    shared: &DualShared,
) -> Option<SocketAddr> {
    let handle = primary.first_connection()?;
    let flags = primary.connection_flags(handle)?;
    if !(flags.server_flag && flags.migration_flag) {
        return None;
    }

    let peer = primary.peer_addr(handle)?;
    primary.clear_migration_flag(handle);

    if let Err(e) = primary.shallow_migrate(handle, backup) {
        log::warn!("shallow_migrate failed: {}", e);
        return None;
    }

    if shared.table.insert(&peer) {
        telemetry::MIGRATIONS_TOTAL.inc();
        log::info!("connection at {} migrated to backup engine", peer);
    }
    Some(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_table_is_monotonic() {
        let table = OwnershipTable::new();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert!(!table.contains(&addr));
        assert!(table.insert(&addr));
        assert!(table.contains(&addr));
        // Re-insert reports "not new" rather than growing the set.
        assert!(!table.insert(&addr));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn handoff_slot_overwrites_when_full() {
        let slot = HandoffSlot::new();
        let mk = |rank: usize| Datagram {
            bytes: vec![0u8; 4],
            addr_from: "10.0.0.1:5000".parse().unwrap(),
            addr_to: "10.0.0.2:4433".parse().unwrap(),
            if_index_to: 0,
            ecn: 0,
            socket_rank: rank,
            arrival_time_us: 0,
        };
        slot.publish(mk(1));
        slot.publish(mk(2));
        let got = slot.take_blocking();
        assert_eq!(got.socket_rank, 2);
    }
}
