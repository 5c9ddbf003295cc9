//! Multiplex waiter: block up to a bounded timeout across every open
//! socket, returning the first arriving datagram plus everything the
//! receive path needs to route and label it.
//!
//! `poll`-then-`recvmsg` shape, with an ancillary-data walk to recover ECN
//! and destination packet-info; fatal/timeout/data outcomes are distinct.

use crate::socket::SocketSet;
use crate::types::{Datagram, MAX_WAIT_US};
use std::io;
use std::time::Instant;

pub enum WaitOutcome {
    Datagram(Datagram),
    Timeout { now_us: u64 },
    FatalIo(io::Error),
}

/// Monotonic reference point for callers that want to measure elapsed wait
/// time rather than wall-clock arrival time.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

#[cfg(unix)]
pub use unix_impl::wait;

#[cfg(windows)]
pub use windows_impl::wait;

/// `poll`+`recvmsg` implementation with full ECN/packet-info recovery.
#[cfg(unix)]
mod unix_impl {
    use super::*;
    use crate::types::{Family, MAX_DATAGRAM_SIZE};
    use log::warn;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::os::unix::io::AsRawFd;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Caps `timeout_us` to [`MAX_WAIT_US`] and waits for the first readable
    /// socket in `sockets`, in rank order. Never blocks longer than the cap.
    pub fn wait(sockets: &SocketSet, timeout_us: i64) -> WaitOutcome {
    let timeout_us = timeout_us.clamp(0, MAX_WAIT_US);

    let mut pollfds: Vec<libc::pollfd> = sockets
        .slots()
        .iter()
        .map(|slot| libc::pollfd {
            fd: slot.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    if pollfds.is_empty() {
        std::thread::sleep(std::time::Duration::from_micros(timeout_us.max(0) as u64));
        return WaitOutcome::Timeout { now_us: now_us() };
    }

    let timeout_ms = ((timeout_us + 999) / 1000) as libc::c_int;
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };

    if ret < 0 {
        return WaitOutcome::FatalIo(io::Error::last_os_error());
    }
    if ret == 0 {
        return WaitOutcome::Timeout { now_us: now_us() };
    }

    for (rank, pfd) in pollfds.iter().enumerate() {
        if pfd.revents & libc::POLLIN == 0 {
            continue;
        }
        let slot = &sockets.slots()[rank];
        match recv_one(slot.socket.as_raw_fd(), slot.family, rank) {
            Ok(dgram) => return WaitOutcome::Datagram(dgram),
            Err(e) => {
                warn!("recvmsg failed on socket rank {}: {}", rank, e);
                return WaitOutcome::FatalIo(e);
            }
        }
    }

    WaitOutcome::Timeout { now_us: now_us() }
    }

    fn now_us() -> u64 {
    // Wall-clock snapshot for datagram timestamping; monotonic `Instant` is
    // used for sleep calibration only, never exposed to callers.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
    }

    fn recv_one(fd: std::os::unix::io::RawFd, family: Family, rank: usize) -> io::Result<Datagram> {
    let mut payload = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cbuf = [0u8; 256];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cbuf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr_from = sockaddr_storage_to_std(&src_storage)?;
    let (addr_to_ip, if_index_to, ecn) = parse_ancillary(&msg, family);

    let local_port = local_port_of(fd).unwrap_or(0);
    let addr_to = SocketAddr::new(addr_to_ip, local_port);

    payload.truncate(n as usize);

    Ok(Datagram {
        bytes: payload,
        addr_from,
        addr_to,
        if_index_to,
        ecn,
        socket_rank: rank,
        arrival_time_us: now_us(),
    })
    }

    fn local_port_of(fd: std::os::unix::io::RawFd) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sockaddr_storage_to_std(&storage)?.port())
    }

    fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported sockaddr family {}", other),
        )),
    }
    }

    /// Walks the cmsg chain for `IP_PKTINFO`/`IPV6_PKTINFO` (destination address
    /// + interface index) and `IP_TOS`/`IPV6_TCLASS` (ECN codepoint, low 2 bits).
    fn parse_ancillary(msg: &libc::msghdr, family: Family) -> (IpAddr, i32, u8) {
    let mut addr_to = match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        Family::Unspec => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let mut if_index = 0i32;
    let mut ecn = 0u8;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            match (c.cmsg_level, c.cmsg_type) {
                (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                    let info = *(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                    addr_to = IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
                    if_index = info.ipi_ifindex;
                }
                (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                    let info = *(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                    addr_to = IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr));
                    if_index = info.ipi6_ifindex as i32;
                }
                (libc::IPPROTO_IP, libc::IP_TOS) => {
                    let tos = *(libc::CMSG_DATA(cmsg) as *const libc::c_uchar);
                    ecn = tos & 0x3;
                }
                (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
                    let tclass = *(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                    ecn = (tclass as u8) & 0x3;
                }
                _ => {}
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
        }
    }

    (addr_to, if_index, ecn)
    }

} // mod unix_impl

/// Reduced-fidelity fallback: plain blocking `recv_from` per socket with a
/// short poll interval, since packet-info/ECN ancillary data needs the
/// `WSARecvMsg` extension this crate does not implement (see `sockopt.rs`).
/// `addr_to`/`if_index_to`/`ecn` are always the unspecified address, index 0
/// and 0 respectively on this path.
#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::types::MAX_DATAGRAM_SIZE;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn wait(sockets: &SocketSet, timeout_us: i64) -> WaitOutcome {
        let timeout_us = timeout_us.clamp(0, MAX_WAIT_US);
        let poll_slice = Duration::from_millis(10);
        let deadline = Instant::now() + Duration::from_micros(timeout_us.max(0) as u64);

        loop {
            for (rank, slot) in sockets.slots().iter().enumerate() {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                match slot.socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        let addr_from: SocketAddr = from.as_socket().unwrap_or_else(|| {
                            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                        });
                        let local_port = sockets.local_port_of(rank).unwrap_or(0);
                        return WaitOutcome::Datagram(Datagram {
                            bytes: buf[..n].to_vec(),
                            addr_from,
                            addr_to: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port),
                            if_index_to: 0,
                            ecn: 0,
                            socket_rank: rank,
                            arrival_time_us: now_us(),
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return WaitOutcome::FatalIo(e),
                }
            }
            if Instant::now() >= deadline {
                return WaitOutcome::Timeout { now_us: now_us() };
            }
            std::thread::sleep(poll_slice);
        }
    }

    fn now_us() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
    }
}
