//! Lock-free packet buffer pool
//!
//! Ingress buffers are all sized to the IPv4 worst case (the larger of the
//! two per-family packet sizes) so any proxy datagram fits regardless of
//! the client's address family. `crossbeam_queue::ArrayQueue` keeps
//! acquire/release contention-free between the ingress reader and the
//! per-session forwarding workers.
//!
//! Ownership is a baton: pool → ingress loop → send queue → forwarding
//! worker → pool. [`PooledBuffer`] returns itself on drop, so any path that
//! abandons a packet still balances the pool.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default pool capacity (number of buffers kept for reuse)
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Statistics for the buffer pool
#[derive(Debug)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from the pool
    reuses: AtomicU64,
    /// Number of buffers returned to the pool
    returns: AtomicU64,
    /// Number of buffers dropped on return (pool was full)
    drops: AtomicU64,
}

impl BufferPoolStats {
    fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Buffers currently out of the pool.
    ///
    /// Zero in steady state; a positive value means packets are in flight,
    /// a persistently growing value means a leak.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        let acquired = self.allocations() + self.reuses();
        acquired.saturating_sub(self.returns() + self.drops())
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers dropped on return (pool full)
    pub drops: u64,
}

impl BufferPoolStatsSnapshot {
    /// Buffers currently out of the pool
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        (self.allocations + self.reuses).saturating_sub(self.returns + self.drops)
    }
}

/// Lock-free pool of fixed-size packet buffers.
#[derive(Debug)]
pub struct PacketBufferPool {
    /// Lock-free queue of available buffers
    buffers: ArrayQueue<Vec<u8>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl PacketBufferPool {
    /// Create a pool holding up to `capacity` buffers of `buffer_size`
    /// bytes.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            stats: BufferPoolStats::new(),
        }
    }

    /// Get a buffer from the pool or allocate a new one.
    ///
    /// Reused buffers are not zeroed; the receive syscall overwrites the
    /// data before anything reads it.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf.clear();
            if buf.capacity() >= self.buffer_size {
                // Safety: capacity was allocated at buffer_size and the
                // contents are only read after a receive fills them.
                unsafe { buf.set_len(self.buffer_size) };
            } else {
                buf.resize(self.buffer_size, 0);
            }
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the pool; a full pool drops it.
    fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pre-allocate `count` buffers to absorb the initial traffic burst.
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            if self.buffers.push(vec![0u8; self.buffer_size]).is_err() {
                break;
            }
        }
    }

    /// Get the buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the number of buffers currently available for reuse
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A buffer borrowed from the pool; returns itself when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Vec<u8>>,
    /// Owning pool
    pool: Arc<PacketBufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    #[allow(clippy::explicit_auto_deref)] // Explicit for clarity
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    #[allow(clippy::explicit_auto_deref)] // Explicit for clarity
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = Arc::new(PacketBufferPool::new(10, 1472));
        assert_eq!(pool.buffer_size(), 1472);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_get_and_return() {
        let pool = Arc::new(PacketBufferPool::new(10, 1472));

        let buf = pool.get();
        assert_eq!(buf.len(), 1472);
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().outstanding(), 1);

        drop(buf);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(pool.available(), 1);

        let _buf = pool.get();
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 1);
    }

    #[test]
    fn test_full_pool_drops_returns() {
        let pool = Arc::new(PacketBufferPool::new(1, 64));

        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);

        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_prewarm() {
        let pool = Arc::new(PacketBufferPool::new(10, 64));
        pool.prewarm(5);
        assert_eq!(pool.available(), 5);

        pool.prewarm(100);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_deref_read_write() {
        let pool = Arc::new(PacketBufferPool::new(10, 64));
        let mut buf = pool.get();

        buf[0] = 42;
        buf[63] = 7;
        assert_eq!(buf[0], 42);
        assert_eq!(buf.as_ref()[63], 7);
        assert_eq!(buf.as_mut().len(), 64);
    }

    #[test]
    fn test_concurrent_balance() {
        use std::thread;

        let pool = Arc::new(PacketBufferPool::new(64, 1472));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut buf = pool.get();
                        buf[0] = 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(
            pool.stats().allocations() + pool.stats().reuses(),
            8 * 200
        );
    }
}
