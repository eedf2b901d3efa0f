//! I/O utilities for the relay
//!
//! The [`PacketBufferPool`] provides lock-free buffer reuse for the ingress
//! hot path: a buffer is acquired per datagram, travels through the session
//! send queue, and returns to the pool when the forwarding worker drops it.
//!
//! The batch helpers wrap `recvmmsg`/`sendmmsg` for the batched relay
//! implementation, amortizing syscall overhead across packets.

mod batch;
mod buffer_pool;

pub use batch::{recv_batch, send_all_batch, MAX_BATCH_SIZE};
pub use buffer_pool::{
    BufferPoolStats, BufferPoolStatsSnapshot, PacketBufferPool, PooledBuffer,
    DEFAULT_POOL_CAPACITY,
};
