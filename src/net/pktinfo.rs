//! `recvmsg`/`sendmsg` with pktinfo ancillary data
//!
//! The proxy socket needs to know which local address each client targeted
//! (`IP_PKTINFO`/`IPV6_PKTINFO` control messages) so replies can claim the
//! same source on multi-homed hosts. Control messages are captured as raw
//! bytes on receive and echoed verbatim on send; [`parse_pktinfo`] only
//! decodes them for validation and logging.
//!
//! Receive flags are validated: a truncated datagram (`MSG_TRUNC`) or a
//! truncated control buffer (`MSG_CTRUNC`) is reported as an error so the
//! caller can drop the packet.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::ptr;

use tokio::io::Interest;
use tokio::net::UdpSocket;

/// Control message buffer size (fits pktinfo for both address families)
pub const CMSG_BUFFER_SIZE: usize = 128;

/// Metadata for one received datagram
#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
    /// Payload length
    pub len: usize,
    /// Length of the control message region written by the kernel
    pub cmsg_len: usize,
    /// Receive flags (`msg_flags` from the kernel)
    pub flags: libc::c_int,
    /// Source address of the datagram
    pub src: SocketAddr,
}

/// Receive one datagram, capturing ancillary data when a control buffer is
/// supplied.
///
/// # Errors
///
/// Returns the underlying `recvmsg` error. `WouldBlock` is retried
/// internally after re-awaiting readiness.
pub async fn recv_msg(
    socket: &UdpSocket,
    buf: &mut [u8],
    mut cmsg_buf: Option<&mut [u8]>,
) -> io::Result<RecvMeta> {
    loop {
        socket.readable().await?;

        match socket.try_io(Interest::READABLE, || {
            recvmsg_once(socket.as_raw_fd(), &mut *buf, cmsg_buf.as_deref_mut())
        }) {
            Ok(meta) => return Ok(meta),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Send one datagram to `dst`, attaching `cmsg` as ancillary data when
/// non-empty.
///
/// # Errors
///
/// Returns the underlying `sendmsg` error. `WouldBlock` is retried
/// internally after re-awaiting writability.
pub async fn send_msg(
    socket: &UdpSocket,
    data: &[u8],
    cmsg: &[u8],
    dst: SocketAddr,
) -> io::Result<usize> {
    loop {
        socket.writable().await?;

        match socket.try_io(Interest::WRITABLE, || {
            sendmsg_once(socket.as_raw_fd(), data, cmsg, dst)
        }) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Turn problematic receive flags into an error.
///
/// # Errors
///
/// Returns `InvalidData` if the datagram (`MSG_TRUNC`) or its control
/// message region (`MSG_CTRUNC`) was truncated.
pub fn parse_flags_for_error(flags: libc::c_int) -> io::Result<()> {
    if flags & libc::MSG_TRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram truncated (MSG_TRUNC)",
        ));
    }
    if flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated (MSG_CTRUNC)",
        ));
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::borrow_as_ptr)] // Required for libc FFI
#[allow(clippy::cast_sign_loss)] // n is guaranteed positive after error check
fn recvmsg_once(
    fd: libc::c_int,
    buf: &mut [u8],
    cmsg_buf: Option<&mut [u8]>,
) -> io::Result<RecvMeta> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    if let Some(cmsg_buf) = cmsg_buf {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = cmsg_buf.len() as _;
    }

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src = socket_addr_from_storage(&src_addr)?;

    Ok(RecvMeta {
        len: n as usize,
        cmsg_len: msg.msg_controllen as usize,
        flags: msg.msg_flags,
        src,
    })
}

#[allow(clippy::borrow_as_ptr)] // Required for libc FFI
#[allow(clippy::cast_sign_loss)] // n is guaranteed positive after error check
fn sendmsg_once(fd: libc::c_int, data: &[u8], cmsg: &[u8], dst: SocketAddr) -> io::Result<usize> {
    let (mut dst_addr, dst_len) = sockaddr_storage_from(dst);

    let mut iov = libc::iovec {
        iov_base: data.as_ptr().cast_mut().cast::<libc::c_void>(),
        iov_len: data.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = ptr::addr_of_mut!(dst_addr).cast::<libc::c_void>();
    msg.msg_namelen = dst_len;
    msg.msg_iov = ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    if !cmsg.is_empty() {
        // The kernel copies the control region before parsing; the stored
        // snapshot is never written through.
        msg.msg_control = cmsg.as_ptr().cast_mut().cast::<libc::c_void>();
        msg.msg_controllen = cmsg.len() as _;
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// Kernel alignment for control message elements
const fn cmsg_align(len: usize) -> usize {
    (len + mem::size_of::<usize>() - 1) & !(mem::size_of::<usize>() - 1)
}

/// Extract the destination address and interface index from a raw pktinfo
/// control message region.
///
/// Handles both `IP_PKTINFO` and `IPV6_PKTINFO`. The walk reads headers
/// unaligned so it works on stored byte copies, not just kernel-filled
/// buffers.
///
/// # Errors
///
/// Returns `InvalidData` if the region is malformed or contains no pktinfo
/// message.
#[allow(clippy::cast_sign_loss)] // ifindex is a small positive integer
pub fn parse_pktinfo(cmsg: &[u8]) -> io::Result<(IpAddr, u32)> {
    let hdr_size = mem::size_of::<libc::cmsghdr>();
    let data_offset = cmsg_align(hdr_size);
    let mut offset = 0usize;

    while offset + hdr_size <= cmsg.len() {
        let hdr: libc::cmsghdr =
            unsafe { ptr::read_unaligned(cmsg.as_ptr().add(offset).cast::<libc::cmsghdr>()) };
        let cmsg_len = hdr.cmsg_len as usize;

        if cmsg_len < data_offset || offset + cmsg_len > cmsg.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed control message header",
            ));
        }

        let data_len = cmsg_len - data_offset;
        let data_ptr = unsafe { cmsg.as_ptr().add(offset + data_offset) };

        if hdr.cmsg_level == libc::SOL_IP
            && hdr.cmsg_type == libc::IP_PKTINFO
            && data_len >= mem::size_of::<libc::in_pktinfo>()
        {
            let pi: libc::in_pktinfo =
                unsafe { ptr::read_unaligned(data_ptr.cast::<libc::in_pktinfo>()) };
            let addr = Ipv4Addr::from(u32::from_be(pi.ipi_addr.s_addr));
            return Ok((IpAddr::V4(addr), pi.ipi_ifindex as u32));
        }

        if hdr.cmsg_level == libc::SOL_IPV6
            && hdr.cmsg_type == libc::IPV6_PKTINFO
            && data_len >= mem::size_of::<libc::in6_pktinfo>()
        {
            let pi: libc::in6_pktinfo =
                unsafe { ptr::read_unaligned(data_ptr.cast::<libc::in6_pktinfo>()) };
            let addr = Ipv6Addr::from(pi.ipi6_addr.s6_addr);
            return Ok((IpAddr::V6(addr), pi.ipi6_ifindex));
        }

        offset += cmsg_align(cmsg_len);
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no pktinfo control message",
    ))
}

/// Convert a socket address to its C representation for `msg_name`.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
pub(crate) fn sockaddr_storage_from(
    addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>(), sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::write(ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>(), sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Convert a kernel-filled `sockaddr_storage` back to a socket address.
pub(crate) fn socket_addr_from_storage(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_cmsg<T: Copy>(level: libc::c_int, ty: libc::c_int, payload: &T) -> Vec<u8> {
        let data_offset = cmsg_align(mem::size_of::<libc::cmsghdr>());
        let cmsg_len = data_offset + mem::size_of::<T>();
        let mut buf = vec![0u8; cmsg_align(cmsg_len)];

        let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
        hdr.cmsg_len = cmsg_len as _;
        hdr.cmsg_level = level;
        hdr.cmsg_type = ty;

        unsafe {
            ptr::write_unaligned(buf.as_mut_ptr().cast::<libc::cmsghdr>(), hdr);
            ptr::write_unaligned(buf.as_mut_ptr().add(data_offset).cast::<T>(), *payload);
        }
        buf
    }

    #[test]
    fn test_parse_ipv4_pktinfo() {
        let pi = libc::in_pktinfo {
            ipi_ifindex: 2,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::new(192, 0, 2, 7)).to_be(),
            },
        };
        let cmsg = encode_cmsg(libc::SOL_IP, libc::IP_PKTINFO, &pi);

        let (addr, ifindex) = parse_pktinfo(&cmsg).unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(ifindex, 2);
    }

    #[test]
    fn test_parse_ipv6_pktinfo() {
        let dst: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let pi = libc::in6_pktinfo {
            ipi6_addr: libc::in6_addr {
                s6_addr: dst.octets(),
            },
            ipi6_ifindex: 3,
        };
        let cmsg = encode_cmsg(libc::SOL_IPV6, libc::IPV6_PKTINFO, &pi);

        let (addr, ifindex) = parse_pktinfo(&cmsg).unwrap();
        assert_eq!(addr, IpAddr::V6(dst));
        assert_eq!(ifindex, 3);
    }

    #[test]
    fn test_parse_pktinfo_rejects_garbage() {
        assert!(parse_pktinfo(&[]).is_err());
        assert!(parse_pktinfo(&[0u8; 7]).is_err());

        // Valid header shape but no pktinfo payload type.
        let payload = [0u8; 4];
        let cmsg = encode_cmsg(libc::SOL_SOCKET, libc::SO_TIMESTAMP, &payload);
        assert!(parse_pktinfo(&cmsg).is_err());
    }

    #[test]
    fn test_parse_pktinfo_rejects_overlong_header() {
        let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
        hdr.cmsg_len = 4096 as _;
        hdr.cmsg_level = libc::SOL_IP;
        hdr.cmsg_type = libc::IP_PKTINFO;

        let mut buf = vec![0u8; 64];
        unsafe { ptr::write_unaligned(buf.as_mut_ptr().cast::<libc::cmsghdr>(), hdr) };
        assert!(parse_pktinfo(&buf).is_err());
    }

    #[test]
    fn test_parse_flags() {
        assert!(parse_flags_for_error(0).is_ok());
        assert!(parse_flags_for_error(libc::MSG_TRUNC).is_err());
        assert!(parse_flags_for_error(libc::MSG_CTRUNC).is_err());
    }

    #[test]
    fn test_sockaddr_round_trip() {
        for addr in [
            "192.0.2.1:51820".parse::<SocketAddr>().unwrap(),
            "[2001:db8::1]:51820".parse::<SocketAddr>().unwrap(),
        ] {
            let (storage, _len) = sockaddr_storage_from(addr);
            assert_eq!(socket_addr_from_storage(&storage).unwrap(), addr);
        }
    }

    #[tokio::test]
    async fn test_recv_send_round_trip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        send_msg(&a, b"ping", &[], b_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let meta = recv_msg(&b, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..meta.len], b"ping");
        assert_eq!(meta.src, a.local_addr().unwrap());
        assert_eq!(meta.cmsg_len, 0);
        parse_flags_for_error(meta.flags).unwrap();
    }
}
