//! Reference [`Engine`] implementation backed by real `quiche::Connection`s.
//!
//! Wraps `quiche::Connection::recv`/`send`, drains `quiche::PathEvent`s in
//! `update_state`, and implements the full engine surface (wake delay,
//! incoming/outgoing packets, path probing, shallow migration) so the loop
//! is runnable end to end.

use crate::engine::{ConnectionFlags, Engine, PreparerSignal};
use crate::types::{ConnectionHandle, Datagram, PreparedPacket, MAX_DATAGRAM_SIZE};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;

struct ConnState {
    conn: quiche::Connection,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    server_flag: bool,
    migration_flag: bool,
    migrated_once: bool,
}

/// One engine instance: a connection table keyed by opaque handle, plus the
/// `quiche::Config` template new connections are built from.
pub struct QuicheEngine {
    connections: HashMap<ConnectionHandle, ConnState>,
    order: Vec<ConnectionHandle>,
    next_handle: u64,
    config: quiche::Config,
    is_server: bool,
}

impl QuicheEngine {
    pub fn new(config: quiche::Config, is_server: bool) -> QuicheEngine {
        QuicheEngine {
            connections: HashMap::new(),
            order: Vec::new(),
            next_handle: 1,
            config,
            is_server,
        }
    }

    fn alloc_handle(&mut self) -> ConnectionHandle {
        let h = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// Registers a connection accepted or opened elsewhere (e.g. by a
    /// listener loop not modeled here) under a fresh handle.
    pub fn insert(
        &mut self,
        conn: quiche::Connection,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> ConnectionHandle {
        let handle = self.alloc_handle();
        self.connections.insert(
            handle,
            ConnState {
                conn,
                peer_addr,
                local_addr,
                server_flag: self.is_server,
                migration_flag: false,
                migrated_once: false,
            },
        );
        self.order.push(handle);
        handle
    }

    /// Raises the migration trigger an application would set after deciding
    /// a connection should move to the backup engine.
    pub fn request_migration(&mut self, handle: ConnectionHandle) {
        if let Some(c) = self.connections.get_mut(&handle) {
            c.migration_flag = true;
        }
    }

    fn route_by_peer(&self, addr_from: SocketAddr) -> Option<ConnectionHandle> {
        self.order
            .iter()
            .copied()
            .find(|h| self.connections.get(h).map(|c| c.peer_addr == addr_from).unwrap_or(false))
    }

    fn update_state(&mut self, handle: ConnectionHandle) {
        let c = match self.connections.get_mut(&handle) {
            Some(c) => c,
            None => return,
        };
        while let Some(event) = c.conn.path_event_next() {
            match event {
                quiche::PathEvent::New(local, peer) => {
                    debug!("path discovered {:?} <-> {:?}", local, peer);
                }
                quiche::PathEvent::Validated(local, peer) => {
                    info!("path validated {:?} <-> {:?}", local, peer);
                }
                quiche::PathEvent::FailedValidation(local, peer) => {
                    warn!("path validation failed {:?} <-> {:?}", local, peer);
                }
                quiche::PathEvent::Closed(local, peer) => {
                    debug!("path closed {:?} <-> {:?}", local, peer);
                }
                quiche::PathEvent::ReusedSourceConnectionId(..) => {}
                quiche::PathEvent::PeerMigrated(local, peer) => {
                    info!("peer migrated, new path {:?} <-> {:?}", local, peer);
                    c.local_addr = local;
                    c.peer_addr = peer;
                }
            }
        }
    }
}

impl Engine for QuicheEngine {
    fn next_wake_delay(&self, _now_us: u64) -> Option<i64> {
        self.order
            .iter()
            .filter_map(|h| self.connections.get(h))
            .filter_map(|c| c.conn.timeout())
            .map(|d| d.as_micros() as i64)
            .min()
    }

    fn incoming_packet(&mut self, datagram: &Datagram) -> Result<(), String> {
        let handle = match self.route_by_peer(datagram.addr_from) {
            Some(h) => h,
            None => {
                return Err(format!("no connection registered for peer {}", datagram.addr_from));
            }
        };
        let c = self.connections.get_mut(&handle).ok_or("connection vanished")?;

        let recv_info = quiche::RecvInfo { from: datagram.addr_from, to: datagram.addr_to };
        let mut buf = datagram.bytes.clone();
        match c.conn.recv(&mut buf, recv_info) {
            Ok(_) => {
                self.update_state(handle);
                Ok(())
            }
            Err(e) => Err(format!("quiche recv error: {}", e)),
        }
    }

    fn prepare_next_packet(&mut self, now_us: u64) -> Result<Option<PreparedPacket>, PreparerSignal> {
        let handle = match self.order.first().copied() {
            Some(h) => h,
            None => return Ok(None),
        };
        let c = match self.connections.get_mut(&handle) {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        match c.conn.send(&mut out) {
            Ok((send_len, send_info)) => {
                let _ = now_us;
                Ok(Some(PreparedPacket {
                    buf: out,
                    send_len,
                    peer_addr: send_info.to,
                    local_addr: send_info.from,
                    if_index: 0,
                    log_cid: c.conn.source_id().to_vec(),
                    last_cnx: Some(handle),
                }))
            }
            Err(quiche::Error::Done) => Ok(None),
            Err(e) => Err(PreparerSignal::from_code(quiche_error_code(&e))),
        }
    }

    fn probe_new_path(
        &mut self,
        handle: ConnectionHandle,
        peer_addr: SocketAddr,
        new_local_addr: SocketAddr,
        _now_us: u64,
    ) -> Result<(), String> {
        let c = self.connections.get_mut(&handle).ok_or("unknown connection")?;
        c.conn
            .probe_path(new_local_addr, peer_addr)
            .map(|_| ())
            .map_err(|e| format!("probe_path failed: {}", e))
    }

    fn notify_destination_unreachable(
        &mut self,
        handle: Option<ConnectionHandle>,
        _now_us: u64,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        _if_index: i32,
        os_error: i32,
    ) {
        warn!(
            "destination unreachable: {} -> {} (cnx {:?}, os_error {})",
            local_addr, peer_addr, handle, os_error
        );
    }

    fn first_connection(&self) -> Option<ConnectionHandle> {
        self.order.first().copied()
    }

    fn connection_flags(&self, handle: ConnectionHandle) -> Option<ConnectionFlags> {
        self.connections.get(&handle).map(|c| ConnectionFlags {
            server_flag: c.server_flag,
            migration_flag: c.migration_flag,
        })
    }

    fn clear_migration_flag(&mut self, handle: ConnectionHandle) {
        if let Some(c) = self.connections.get_mut(&handle) {
            c.migration_flag = false;
        }
    }

    fn peer_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.connections.get(&handle).map(|c| c.peer_addr)
    }

    fn local_addr(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.connections.get(&handle).map(|c| c.local_addr)
    }

    fn shallow_migrate(&mut self, handle: ConnectionHandle, backup: &mut dyn Engine) -> Result<(), String> {
        let mut state = self.connections.remove(&handle).ok_or("unknown connection")?;
        self.order.retain(|h| *h != handle);
        if state.migrated_once {
            return Err("connection already migrated once".to_string());
        }
        state.migrated_once = true;

        let backup = backup
            .as_any_mut()
            .downcast_mut::<QuicheEngine>()
            .ok_or("shallow_migrate requires a QuicheEngine backup")?;
        let new_handle = backup.alloc_handle();
        let peer_addr = state.peer_addr;
        let local_addr = state.local_addr;
        let server_flag = state.server_flag;
        backup.connections.insert(
            new_handle,
            ConnState {
                conn: state.conn,
                peer_addr,
                local_addr,
                server_flag,
                migration_flag: false,
                migrated_once: true,
            },
        );
        backup.order.push(new_handle);
        Ok(())
    }

    fn migrate(&mut self, new_engine: &mut dyn Engine) -> Result<(), String> {
        let handle = self.order.first().copied().ok_or("no connection to migrate")?;
        self.shallow_migrate(handle, new_engine)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn quiche_error_code(e: &quiche::Error) -> i32 {
    match e {
        quiche::Error::Done => crate::engine::TERMINATE_PACKET_LOOP,
        _ => -1,
    }
}
