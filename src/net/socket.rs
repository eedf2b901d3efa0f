//! UDP socket construction for the relay
//!
//! Two socket shapes exist:
//!
//! - The **proxy socket** listens for obfuscated datagrams. It has
//!   `IP_PKTINFO` (and `IPV6_RECVPKTINFO` for IPv6 listeners) enabled so
//!   each datagram carries the local destination address the client aimed
//!   at, and binds dual-stack when the listen address is IPv6.
//! - An **upstream socket** per session talks to the fixed WireGuard
//!   endpoint from an ephemeral port, letting the OS demultiplex return
//!   traffic by socket.
//!
//! Both accept an optional fwmark (`SO_MARK`) for policy routing; 0 means
//! unset. Setting a mark requires `CAP_NET_ADMIN`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::RelayError;

/// Create the proxy-side listen socket with pktinfo reporting enabled.
///
/// # Errors
///
/// Returns `RelayError` if socket creation, option setup, or binding fails.
/// `SO_MARK` failures surface as [`RelayError::PermissionDenied`] when the
/// process lacks `CAP_NET_ADMIN`.
pub fn bind_proxy_socket(listen: SocketAddr, fwmark: u32) -> Result<UdpSocket, RelayError> {
    let socket = new_udp_socket(listen.is_ipv4())?;

    if fwmark != 0 {
        set_fwmark(&socket, fwmark)?;
    }

    if listen.is_ipv4() {
        set_pktinfo_v4(&socket)?;
    } else {
        // Dual-stack listeners also see IPv4 clients as mapped addresses,
        // which deliver IP_PKTINFO rather than IPV6_PKTINFO.
        set_pktinfo_v6(&socket)?;
        set_pktinfo_v4(&socket)?;
    }

    socket
        .bind(&listen.into())
        .map_err(|e| RelayError::bind(listen, e.to_string()))?;

    debug!("Created proxy socket on {} (fwmark={})", listen, fwmark);
    into_tokio(socket)
}

/// Create a per-session upstream socket bound to an ephemeral wildcard
/// address of the remote endpoint's family.
///
/// # Errors
///
/// Returns `RelayError` if socket creation, option setup, or binding fails.
pub fn bind_upstream_socket(remote: SocketAddr, fwmark: u32) -> Result<UdpSocket, RelayError> {
    let socket = new_udp_socket(remote.is_ipv4())?;

    if fwmark != 0 {
        set_fwmark(&socket, fwmark)?;
    }

    let local: SocketAddr = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    socket
        .bind(&local.into())
        .map_err(|e| RelayError::bind(local, e.to_string()))?;

    into_tokio(socket)
}

fn new_udp_socket(ipv4: bool) -> Result<Socket, RelayError> {
    let domain = if ipv4 { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| RelayError::SocketCreation(e.to_string()))?;

    if !ipv4 {
        socket
            .set_only_v6(false)
            .map_err(|e| RelayError::socket_option("IPV6_V6ONLY", e.to_string()))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| RelayError::socket_option("O_NONBLOCK", e.to_string()))?;

    Ok(socket)
}

fn into_tokio(socket: Socket) -> Result<UdpSocket, RelayError> {
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(RelayError::IoError)
}

/// Set `SO_MARK` for policy routing.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
fn set_fwmark(socket: &Socket, mark: u32) -> Result<(), RelayError> {
    let fd = socket.as_raw_fd();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(RelayError::PermissionDenied);
        }
        return Err(RelayError::socket_option(
            "SO_MARK",
            format!("Failed to set fwmark {mark}: {err}"),
        ));
    }

    debug!("Set fwmark: {}", mark);
    Ok(())
}

/// Enable `IP_PKTINFO` reporting.
fn set_pktinfo_v4(socket: &Socket) -> Result<(), RelayError> {
    set_int_option(socket, libc::SOL_IP, libc::IP_PKTINFO, "IP_PKTINFO")
}

/// Enable `IPV6_RECVPKTINFO` reporting.
fn set_pktinfo_v6(socket: &Socket) -> Result<(), RelayError> {
    set_int_option(
        socket,
        libc::SOL_IPV6,
        libc::IPV6_RECVPKTINFO,
        "IPV6_RECVPKTINFO",
    )
}

#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
fn set_int_option(
    socket: &Socket,
    level: libc::c_int,
    option: libc::c_int,
    name: &str,
) -> Result<(), RelayError> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(RelayError::socket_option(name, err.to_string()));
    }

    Ok(())
}
