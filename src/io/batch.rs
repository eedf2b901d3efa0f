//! Batch UDP I/O using `sendmmsg`/`recvmmsg`
//!
//! The batched relay implementation amortizes syscall overhead across
//! packets: the ingress loop pulls up to a configured number of datagrams
//! (each with its own pktinfo control slot) out of one `recvmmsg` call, and
//! the forwarding worker flushes a queue drain toward the WireGuard
//! endpoint with one `sendmmsg` call.
//!
//! Linux only, like the rest of the socket layer.

use std::io;
use std::mem;
use std::ops::DerefMut;
use std::os::unix::io::AsRawFd;
use std::ptr;

use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::net::{socket_addr_from_storage, sockaddr_storage_from, RecvMeta, CMSG_BUFFER_SIZE};

/// Maximum number of packets per batch syscall
pub const MAX_BATCH_SIZE: usize = 256;

/// Receive a batch of datagrams, each with its own ancillary-data slot.
///
/// Returns one [`RecvMeta`] per received datagram, in slot order: datagram
/// `i` landed in `bufs[i]` with its control bytes in `cmsg_bufs[i]`. May
/// return fewer entries than slots when the socket drains.
///
/// # Errors
///
/// Returns the underlying `recvmmsg` error. `WouldBlock` is retried
/// internally after re-awaiting readiness.
pub async fn recv_batch<B: DerefMut<Target = [u8]>>(
    socket: &UdpSocket,
    bufs: &mut [B],
    cmsg_bufs: &mut [[u8; CMSG_BUFFER_SIZE]],
) -> io::Result<Vec<RecvMeta>> {
    if bufs.is_empty() || cmsg_bufs.is_empty() {
        return Ok(Vec::new());
    }

    loop {
        socket.readable().await?;

        match socket.try_io(Interest::READABLE, || {
            recvmmsg_once(socket.as_raw_fd(), &mut *bufs, &mut *cmsg_bufs)
        }) {
            Ok(metas) => return Ok(metas),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Send every packet to `dst`, batching with `sendmmsg` and resuming after
/// partial sends.
///
/// # Errors
///
/// Returns the underlying `sendmmsg` error; packets before the failure may
/// already be on the wire.
pub async fn send_all_batch(
    socket: &UdpSocket,
    packets: &[&[u8]],
    dst: std::net::SocketAddr,
) -> io::Result<()> {
    let mut sent = 0;

    while sent < packets.len() {
        socket.writable().await?;

        match socket.try_io(Interest::WRITABLE, || {
            sendmmsg_once(socket.as_raw_fd(), &packets[sent..], dst)
        }) {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::cast_possible_wrap)] // batch counts are far below c_uint::MAX
#[allow(clippy::cast_sign_loss)] // ret is guaranteed positive after error check
fn recvmmsg_once<B: DerefMut<Target = [u8]>>(
    fd: libc::c_int,
    bufs: &mut [B],
    cmsg_bufs: &mut [[u8; CMSG_BUFFER_SIZE]],
) -> io::Result<Vec<RecvMeta>> {
    let count = bufs.len().min(cmsg_bufs.len()).min(MAX_BATCH_SIZE);
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut addrs: Vec<libc::sockaddr_storage> =
        vec![unsafe { mem::zeroed() }; count];
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(count);
    let mut msgs: Vec<libc::mmsghdr> = Vec::with_capacity(count);

    for buf in bufs.iter_mut().take(count) {
        let slice: &mut [u8] = buf;
        iovecs.push(libc::iovec {
            iov_base: slice.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: slice.len(),
        });
    }

    for i in 0..count {
        let mut msg: libc::mmsghdr = unsafe { mem::zeroed() };
        msg.msg_hdr.msg_name = ptr::addr_of_mut!(addrs[i]).cast::<libc::c_void>();
        msg.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_hdr.msg_iov = ptr::addr_of_mut!(iovecs[i]);
        msg.msg_hdr.msg_iovlen = 1;
        msg.msg_hdr.msg_control = cmsg_bufs[i].as_mut_ptr().cast::<libc::c_void>();
        msg.msg_hdr.msg_controllen = CMSG_BUFFER_SIZE as _;
        msgs.push(msg);
    }

    loop {
        // Safety: every pointer in msgs targets memory owned by the
        // arguments or the local vectors, all sized for count entries.
        let ret = unsafe {
            libc::recvmmsg(
                fd,
                msgs.as_mut_ptr(),
                count as libc::c_uint,
                0,
                ptr::null_mut(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let received = ret as usize;
        let mut metas = Vec::with_capacity(received);
        for i in 0..received {
            metas.push(RecvMeta {
                len: msgs[i].msg_len as usize,
                cmsg_len: msgs[i].msg_hdr.msg_controllen as usize,
                flags: msgs[i].msg_hdr.msg_flags,
                src: socket_addr_from_storage(&addrs[i])?,
            });
        }
        return Ok(metas);
    }
}

#[allow(clippy::cast_possible_wrap)] // batch counts are far below c_uint::MAX
#[allow(clippy::cast_sign_loss)] // ret is guaranteed positive after error check
fn sendmmsg_once(fd: libc::c_int, packets: &[&[u8]], dst: std::net::SocketAddr) -> io::Result<usize> {
    let count = packets.len().min(MAX_BATCH_SIZE);
    if count == 0 {
        return Ok(0);
    }

    let (mut dst_addr, dst_len) = sockaddr_storage_from(dst);

    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(count);
    let mut msgs: Vec<libc::mmsghdr> = Vec::with_capacity(count);

    for packet in packets.iter().take(count) {
        iovecs.push(libc::iovec {
            iov_base: packet.as_ptr().cast_mut().cast::<libc::c_void>(),
            iov_len: packet.len(),
        });
    }

    for iovec in &mut iovecs {
        let mut msg: libc::mmsghdr = unsafe { mem::zeroed() };
        msg.msg_hdr.msg_name = ptr::addr_of_mut!(dst_addr).cast::<libc::c_void>();
        msg.msg_hdr.msg_namelen = dst_len;
        msg.msg_hdr.msg_iov = ptr::addr_of_mut!(*iovec);
        msg.msg_hdr.msg_iovlen = 1;
        msgs.push(msg);
    }

    loop {
        // Safety: all pointers in msgs stay valid for the duration of the
        // call; the destination sockaddr outlives it on the stack.
        let ret = unsafe { libc::sendmmsg(fd, msgs.as_mut_ptr(), count as libc::c_uint, 0) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        return Ok(ret as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_all_batch() {
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = rx.local_addr().unwrap();

        let packets: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        send_all_batch(&tx, &packets, dst).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let (n, _) = timeout(Duration::from_secs(2), rx.recv_from(&mut buf))
                .await
                .expect("batch packet should arrive")
                .unwrap();
            received.push(buf[..n].to_vec());
        }
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn test_recv_batch() {
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = rx.local_addr().unwrap();
        let tx_addr = tx.local_addr().unwrap();

        for payload in [&b"alpha"[..], b"beta", b"gamma"] {
            tx.send_to(payload, dst).await.unwrap();
        }

        let mut bufs: Vec<Vec<u8>> = vec![vec![0u8; 64]; 8];
        let mut cmsg_bufs = vec![[0u8; CMSG_BUFFER_SIZE]; 8];

        let mut collected = Vec::new();
        while collected.len() < 3 {
            let metas = timeout(
                Duration::from_secs(2),
                recv_batch(&rx, &mut bufs, &mut cmsg_bufs),
            )
            .await
            .expect("batch should arrive")
            .unwrap();

            for (i, meta) in metas.iter().enumerate() {
                assert_eq!(meta.src, tx_addr);
                collected.push(bufs[i][..meta.len].to_vec());
            }
        }

        collected.sort();
        assert_eq!(
            collected,
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_empty_batches() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = socket.local_addr().unwrap();

        send_all_batch(&socket, &[], dst).await.unwrap();

        let mut bufs: Vec<Vec<u8>> = Vec::new();
        let mut cmsg_bufs: Vec<[u8; CMSG_BUFFER_SIZE]> = Vec::new();
        let metas = recv_batch(&socket, &mut bufs, &mut cmsg_bufs).await.unwrap();
        assert!(metas.is_empty());
    }
}
