//! Per-client session state
//!
//! One [`SessionEntry`] exists per active remote client, keyed by the
//! client's source address in the server's session table. The entry holds
//! the shared halves of the session: the upstream socket, the send queue's
//! sender, the deadline handle, and the pktinfo snapshot cell. The worker
//! tasks own the receiving halves.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::io::PooledBuffer;
use crate::net::DeadlineHandle;

/// A decrypted WireGuard packet queued for forwarding.
///
/// Carries its pool buffer; dropping a queued packet anywhere returns the
/// buffer to the pool.
#[derive(Debug)]
pub(crate) struct QueuedPacket {
    /// Pool buffer holding the packet bytes
    pub buf: PooledBuffer,
    /// Offset of the WireGuard packet inside `buf`
    pub start: usize,
    /// Length of the WireGuard packet
    pub len: usize,
}

impl QueuedPacket {
    /// The WireGuard packet bytes.
    pub fn packet(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }
}

/// Session state shared through the table.
///
/// Dropping the entry (removal from the table) drops `send_queue`, which
/// closes the queue: the forwarding worker drains what is left and exits.
pub(crate) struct SessionEntry {
    /// Socket toward the WireGuard endpoint, ephemeral local port
    pub wg_socket: Arc<UdpSocket>,
    /// Bounded queue of decrypted packets awaiting forwarding
    pub send_queue: mpsc::Sender<QueuedPacket>,
    /// Read deadline of the upstream socket; refreshed by handshakes,
    /// injected by Stop
    pub deadline: DeadlineHandle,
    /// Latest pktinfo control-message bytes, read lock-free by the reply
    /// worker
    pub pktinfo_current: Arc<ArcSwap<Vec<u8>>>,
    /// Last pktinfo bytes compared against; only the ingress loop touches
    /// this, under the table mutex
    pub pktinfo_cache: Vec<u8>,
    /// Proxy-side packet size limit for this client's address family
    pub max_proxy_packet_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PacketBufferPool;

    #[test]
    fn test_queued_packet_window() {
        let pool = Arc::new(PacketBufferPool::new(4, 128));
        let mut buf = pool.get();
        buf[10..14].copy_from_slice(b"\x04\x00\x00\x00");

        let pkt = QueuedPacket {
            buf,
            start: 10,
            len: 4,
        };
        assert_eq!(pkt.packet(), b"\x04\x00\x00\x00");

        drop(pkt);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropped_queue_returns_buffers() {
        let pool = Arc::new(PacketBufferPool::new(4, 128));
        let (tx, rx) = mpsc::channel::<QueuedPacket>(2);

        tx.try_send(QueuedPacket {
            buf: pool.get(),
            start: 0,
            len: 16,
        })
        .unwrap();
        tx.try_send(QueuedPacket {
            buf: pool.get(),
            start: 0,
            len: 16,
        })
        .unwrap();
        assert_eq!(pool.stats().outstanding(), 2);

        // Closing the queue with packets still inside must not leak them.
        drop(tx);
        drop(rx);
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
