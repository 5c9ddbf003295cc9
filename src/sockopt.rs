//! Low-level socket option plumbing: ECN receive/send and packet-info
//! (arrival destination address + interface index) ancillary data.
//!
//! Expressed against `libc` directly since no cross-platform crate exposes
//! both cmsg-level ECN and packet-info in one call.

use crate::types::Family;
use std::io;

#[cfg(unix)]
pub fn set_ecn_options(sock: &socket2::Socket, family: Family) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = sock.as_raw_fd();
    unsafe {
        let one: libc::c_int = 1;
        let ret = match family {
            Family::V4 => libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_RECVTOS,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            ),
            Family::V6 => libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVTCLASS,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            ),
            Family::Unspec => unreachable!("socket already has a concrete family"),
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(unix)]
pub fn set_pkt_info(sock: &socket2::Socket, family: Family) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = sock.as_raw_fd();
    unsafe {
        let one: libc::c_int = 1;
        let ret = match family {
            Family::V4 => libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                pktinfo_opt_v4(),
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            ),
            Family::V6 => libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVPKTINFO,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            ),
            Family::Unspec => unreachable!("socket already has a concrete family"),
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn pktinfo_opt_v4() -> libc::c_int {
    libc::IP_PKTINFO
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pktinfo_opt_v4() -> libc::c_int {
    // BSD/macOS name the same ancillary-data request IP_RECVPKTINFO.
    libc::IP_RECVPKTINFO
}

#[cfg(windows)]
pub fn set_ecn_options(_sock: &socket2::Socket, _family: Family) -> io::Result<()> {
    // Windows ECN/packet-info ancillary data requires WSARecvMsg plumbing
    // this crate does not implement; receives simply report ECN = 0.
    Ok(())
}

#[cfg(windows)]
pub fn set_pkt_info(_sock: &socket2::Socket, _family: Family) -> io::Result<()> {
    Ok(())
}
