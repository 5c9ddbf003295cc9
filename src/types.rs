//! Shared data model: the datagram descriptors, address-family tag and
//! connection handle that flow between every other module.

use std::net::SocketAddr;

/// Maximum UDP payload the loop will ever move in or out of a socket.
pub const MAX_DATAGRAM_SIZE: usize = 1536;

/// Upper bound on how many sockets one loop instance may hold open at once.
/// Rank 0 is always the home port; ranks 1.. are migration-test sockets
/// opened on demand by [`crate::migration_test`].
pub const SOCKETS_MAX: usize = 4;

/// The `next_wake_delay`/`select` timeout ceiling, in microseconds.
pub const MAX_WAIT_US: i64 = 10_000_000;

/// Address family a socket or peer address belongs to.
///
/// `Unspec` is only ever a request ("open one of each"); a bound socket or
/// a received datagram always carries a concrete `V4`/`V6`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Unspec,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn to_domain(self) -> socket2::Domain {
        match self {
            Family::V4 => socket2::Domain::IPV4,
            Family::V6 => socket2::Domain::IPV6,
            Family::Unspec => unreachable!("Unspec has no socket domain"),
        }
    }
}

/// Opaque handle to a connection owned by an [`crate::engine::Engine`].
///
/// Unlike a raw or weak pointer, a handle has no lifetime tied to the
/// engine's internal allocator: it is just an index the engine resolves on
/// demand, so it cannot dangle if the engine frees the connection between
/// calls (the engine simply returns `None`/an error).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// A datagram as it came off the wire, plus everything the receive path
/// needs to route and label it.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub addr_from: SocketAddr,
    pub addr_to: SocketAddr,
    pub if_index_to: i32,
    /// 2-bit ECN codepoint as received, in the low bits.
    pub ecn: u8,
    /// Which entry of the socket set this datagram arrived on.
    pub socket_rank: usize,
    /// Monotonic microsecond timestamp taken by the waiter after wakeup.
    pub arrival_time_us: u64,
}

/// One prepared outbound datagram, as returned by
/// [`crate::engine::Engine::prepare_next_packet`].
pub struct PreparedPacket {
    pub buf: Vec<u8>,
    pub send_len: usize,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub if_index: i32,
    /// Connection-ID echo, for log correlation only.
    pub log_cid: Vec<u8>,
    pub last_cnx: Option<ConnectionHandle>,
}
