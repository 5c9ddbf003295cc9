//! Socket set manager: open/bind/close the 1–N UDP sockets the loop
//! drives, with ECN + packet-info options enabled on every one of them.
//!
//! All-or-nothing open semantics, rank ordering (home port at 0), and a
//! rollback-on-failure path that closes exactly the sockets it opened
//! (see DESIGN.md for the index bug this avoids).

use crate::error::{LoopError, Result};
use crate::types::{Family, SOCKETS_MAX};
use log::{debug, warn};
use socket2::{Protocol, Socket, Type};
use std::net::SocketAddr;

pub struct SocketSlot {
    pub socket: Socket,
    pub family: Family,
}

/// The ordered sequence of sockets a loop instance owns. Rank 0 is the home
/// port; entries pushed afterwards are migration-test sockets.
pub struct SocketSet {
    slots: Vec<SocketSlot>,
}

impl SocketSet {
    /// Opens one socket per concrete family, or one `AF_INET` + one
    /// `AF_INET6` socket when `family` is `Family::Unspec`.
    ///
    /// On any failure, every socket already opened by this call is closed
    /// and `Err` is returned; there is never a partially open set.
    pub fn open(local_port: u16, family: Family) -> Result<SocketSet> {
        let families: Vec<Family> = match family {
            Family::Unspec => vec![Family::V4, Family::V6],
            f => vec![f],
        };

        if families.len() > SOCKETS_MAX {
            warn!(
                "cannot open {} sockets, max set to {}",
                families.len(),
                SOCKETS_MAX
            );
            return Err(LoopError::SocketOpen { family, port: local_port });
        }

        let mut opened: Vec<SocketSlot> = Vec::with_capacity(families.len());
        for f in families {
            match Self::open_one(local_port, f) {
                Ok(slot) => opened.push(slot),
                Err(e) => {
                    warn!(
                        "cannot open socket (af={:?}, port={}): {}",
                        f, local_port, e
                    );
                    // Roll back every socket opened earlier in this call.
                    for mut s in opened {
                        let _ = s.socket.shutdown(std::net::Shutdown::Both);
                    }
                    return Err(LoopError::SocketOpen { family: f, port: local_port });
                }
            }
        }

        debug!("opened {} socket(s) at port {}", opened.len(), local_port);
        Ok(SocketSet { slots: opened })
    }

    fn open_one(local_port: u16, family: Family) -> std::io::Result<SocketSlot> {
        let socket = Socket::new(family.to_domain(), Type::DGRAM, Some(Protocol::UDP))?;
        crate::sockopt::set_ecn_options(&socket, family)?;
        crate::sockopt::set_pkt_info(&socket, family)?;
        if local_port != 0 {
            let bind_addr: SocketAddr = match family {
                Family::V4 => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), local_port),
                Family::V6 => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), local_port),
                Family::Unspec => unreachable!(),
            };
            socket.bind(&bind_addr.into())?;
        } else {
            let any: SocketAddr = match family {
                Family::V4 => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
                Family::V6 => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0),
                Family::Unspec => unreachable!(),
            };
            socket.bind(&any.into())?;
        }
        socket.set_nonblocking(true)?;
        Ok(SocketSlot { socket, family })
    }

    /// Opens exactly one socket, for the migration-test hooks.
    pub fn open_single(local_port: u16, family: Family) -> Result<SocketSlot> {
        Self::open_one(local_port, family)
            .map_err(|_| LoopError::SocketOpen { family, port: local_port })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[SocketSlot] {
        &self.slots
    }

    pub fn get(&self, rank: usize) -> Option<&SocketSlot> {
        self.slots.get(rank)
    }

    pub fn replace(&mut self, rank: usize, slot: SocketSlot) {
        self.slots[rank] = slot;
    }

    pub fn push(&mut self, slot: SocketSlot) -> bool {
        if self.slots.len() >= SOCKETS_MAX {
            return false;
        }
        self.slots.push(slot);
        true
    }

    /// Picks the first socket whose family matches `peer_family`.
    pub fn select_send_socket(&self, peer_family: Family) -> Option<usize> {
        self.slots.iter().position(|s| s.family == peer_family)
    }

    pub fn local_port_of(&self, rank: usize) -> std::io::Result<u16> {
        let addr = self.slots[rank].socket.local_addr()?;
        Ok(addr.as_socket().map(|a| a.port()).unwrap_or(0))
    }

    /// Close every socket this set owns. Safe to call more than once.
    pub fn close_all(&mut self) {
        for slot in self.slots.drain(..) {
            drop(slot.socket);
        }
    }
}

impl Drop for SocketSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_unspec_yields_v4_then_v6() {
        let set = SocketSet::open(0, Family::Unspec).expect("open");
        assert_eq!(set.len(), 2);
        assert_eq!(set.slots()[0].family, Family::V4);
        assert_eq!(set.slots()[1].family, Family::V6);
    }

    #[test]
    fn open_concrete_family_yields_one_socket() {
        let set = SocketSet::open(0, Family::V4).expect("open");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn select_send_socket_matches_family() {
        let set = SocketSet::open(0, Family::Unspec).expect("open");
        assert_eq!(set.select_send_socket(Family::V4), Some(0));
        assert_eq!(set.select_send_socket(Family::V6), Some(1));
    }

    #[test]
    fn close_all_empties_the_set() {
        let mut set = SocketSet::open(0, Family::Unspec).expect("open");
        set.close_all();
        assert!(set.is_empty());
    }
}
