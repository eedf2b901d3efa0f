//! Relay server: ingress loop, session workers, lifecycle
//!
//! One task reads the proxy socket. Serializing ingress on a single reader
//! keeps session creation race-free (the table mutex is only taken here and
//! by workers during teardown), makes the pktinfo cache a single-writer
//! value, and avoids cross-CPU coherency cost on the hot path. Each session
//! adds two tasks: a forwarding worker draining the send queue toward the
//! WireGuard endpoint, and a reply worker mirroring return traffic to the
//! client.
//!
//! The table mutex is never held across a socket operation; everything in
//! its critical sections (upstream socket creation, channel setup, task
//! spawn, pktinfo compare and publish, queue push) is synchronous.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, RelayError};
use crate::io::{
    recv_batch, send_all_batch, BufferPoolStatsSnapshot, PacketBufferPool, PooledBuffer,
    DEFAULT_POOL_CAPACITY,
};
use crate::net::{
    bind_proxy_socket, bind_upstream_socket, is_ipv4_family, mapped_eq, parse_flags_for_error,
    parse_pktinfo, read_deadline, recv_msg, resolve_endpoint, send_msg, DeadlineHandle,
    DeadlineWatcher, CMSG_BUFFER_SIZE,
};
use crate::packet::{handler_for_mode, PacketHandler};

use super::session::{QueuedPacket, SessionEntry};
use super::{
    IPV4_HEADER_LENGTH, IPV6_HEADER_LENGTH, MINIMUM_MTU, REJECT_AFTER_TIME, UDP_HEADER_LENGTH,
    WIREGUARD_DATA_PACKET_LENGTH_MASK, WIREGUARD_DATA_PACKET_OVERHEAD,
    WIREGUARD_MESSAGE_TYPE_HANDSHAKE_INITIATION, WIREGUARD_MESSAGE_TYPE_HANDSHAKE_RESPONSE,
};

/// Relay implementation selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    /// One datagram per syscall
    Generic,
    /// `recvmmsg`/`sendmmsg` batching
    Sendmmsg,
}

/// Live state between start and stop
struct ServerRuntime {
    proxy_socket: Arc<UdpSocket>,
    proxy_deadline: DeadlineHandle,
    ingress_tasks: TaskTracker,
    session_tasks: TaskTracker,
}

/// An obfuscating relay server instance.
///
/// Construct with [`Server::new`], then [`Server::start`] within a tokio
/// runtime. [`Server::stop`] shuts down cleanly and is idempotent.
pub struct Server {
    name: String,
    proxy_listen: String,
    proxy_fwmark: u32,
    wg_fwmark: u32,
    batch_mode: BatchMode,
    relay_batch_size: usize,
    main_recv_batch_size: usize,
    send_channel_capacity: usize,
    max_proxy_packet_size_v4: usize,
    max_proxy_packet_size_v6: usize,
    wg_tunnel_mtu_v4: usize,
    wg_tunnel_mtu_v6: usize,
    wg_addr: SocketAddr,
    handler: Arc<dyn PacketHandler>,
    pool: Arc<PacketBufferPool>,
    table: Arc<Mutex<HashMap<SocketAddr, SessionEntry>>>,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl Server {
    /// Build a server from its configuration.
    ///
    /// Resolves the WireGuard endpoint and constructs the packet handler;
    /// both are fatal if they fail.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an MTU below 1280, an unknown
    /// proxy mode, an unusable PSK, invalid perf values, or an
    /// unresolvable WireGuard endpoint.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let mut config = config;

        if config.mtu < MINIMUM_MTU {
            return Err(crate::error::ConfigError::MtuTooSmall { mtu: config.mtu }.into());
        }
        config.perf.check_and_apply_defaults()?;

        let psk = config.decode_psk()?;
        let handler = handler_for_mode(&config.proxy_mode, &psk)?;
        let wg_addr = resolve_endpoint(&config.wg_endpoint)?;

        let max_proxy_packet_size_v4 = config.mtu - IPV4_HEADER_LENGTH - UDP_HEADER_LENGTH;
        let max_proxy_packet_size_v6 = config.mtu - IPV6_HEADER_LENGTH - UDP_HEADER_LENGTH;

        let overhead = handler.front_overhead() + handler.rear_overhead();
        let wg_tunnel_mtu_v4 = (max_proxy_packet_size_v4 - overhead - WIREGUARD_DATA_PACKET_OVERHEAD)
            & WIREGUARD_DATA_PACKET_LENGTH_MASK;
        let wg_tunnel_mtu_v6 = (max_proxy_packet_size_v6 - overhead - WIREGUARD_DATA_PACKET_OVERHEAD)
            & WIREGUARD_DATA_PACKET_LENGTH_MASK;

        let batch_mode = match config.perf.batch_mode.as_str() {
            "no" => BatchMode::Generic,
            // Empty selects the platform default; the socket layer is
            // Linux-only, so that is the batched implementation.
            _ => BatchMode::Sendmmsg,
        };

        let pool = Arc::new(PacketBufferPool::new(
            DEFAULT_POOL_CAPACITY,
            max_proxy_packet_size_v4,
        ));
        pool.prewarm(config.perf.main_recv_batch_size);

        Ok(Self {
            name: config.name,
            proxy_listen: config.proxy_listen,
            proxy_fwmark: config.proxy_fwmark,
            wg_fwmark: config.wg_fwmark,
            batch_mode,
            relay_batch_size: config.perf.relay_batch_size,
            main_recv_batch_size: config.perf.main_recv_batch_size,
            send_channel_capacity: config.perf.send_channel_capacity,
            max_proxy_packet_size_v4,
            max_proxy_packet_size_v6,
            wg_tunnel_mtu_v4,
            wg_tunnel_mtu_v6,
            wg_addr,
            handler,
            pool,
            table: Arc::new(Mutex::new(HashMap::new())),
            runtime: Mutex::new(None),
        })
    }

    /// The configured instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local address of the proxy socket while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .lock()
            .as_ref()
            .and_then(|rt| rt.proxy_socket.local_addr().ok())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Snapshot of the packet buffer pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> BufferPoolStatsSnapshot {
        self.pool.stats().snapshot()
    }

    /// Bind the proxy socket and launch the ingress task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already running, the listen
    /// address does not resolve, or the proxy socket cannot be created.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(RelayError::AlreadyRunning.into());
        }

        let listen_addr = resolve_endpoint(&self.proxy_listen)?;
        let proxy_socket = Arc::new(bind_proxy_socket(listen_addr, self.proxy_fwmark)?);
        let (proxy_deadline, watcher) =
            read_deadline(Instant::now() + Duration::from_secs(86_400 * 365 * 100));

        let ingress_tasks = TaskTracker::new();
        let session_tasks = TaskTracker::new();

        let server = Arc::clone(self);
        let ingress_socket = Arc::clone(&proxy_socket);
        let workers = session_tasks.clone();
        ingress_tasks.spawn(async move {
            match server.batch_mode {
                BatchMode::Generic => {
                    server
                        .recv_from_proxy_generic(ingress_socket, watcher, workers)
                        .await;
                }
                BatchMode::Sendmmsg => {
                    server
                        .recv_from_proxy_batched(ingress_socket, watcher, workers)
                        .await;
                }
            }
        });

        info!(
            server = %self.name,
            listen_address = %self.proxy_listen,
            wg_address = %self.wg_addr,
            wg_tunnel_mtu_v4 = self.wg_tunnel_mtu_v4,
            wg_tunnel_mtu_v6 = self.wg_tunnel_mtu_v6,
            "Started service"
        );

        *runtime = Some(ServerRuntime {
            proxy_socket,
            proxy_deadline,
            ingress_tasks,
            session_tasks,
        });
        Ok(())
    }

    /// Shut the server down.
    ///
    /// Expires the proxy socket's read deadline, waits for the ingress
    /// task (no new sessions after this), expires every session's
    /// upstream deadline, waits for all workers, then closes the proxy
    /// socket. In-flight queued packets are written out before their
    /// sessions exit. Calling stop on a stopped server is a no-op.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let now = Instant::now();
        runtime.proxy_deadline.set(now);
        runtime.ingress_tasks.close();
        runtime.ingress_tasks.wait().await;

        {
            let table = self.table.lock();
            for entry in table.values() {
                entry.deadline.set(now);
            }
        }

        runtime.session_tasks.close();
        runtime.session_tasks.wait().await;

        drop(runtime.proxy_socket);

        info!(server = %self.name, "Stopped service");
    }

    fn max_proxy_packet_size_for(&self, client_addr: &SocketAddr) -> usize {
        if is_ipv4_family(client_addr) {
            self.max_proxy_packet_size_v4
        } else {
            self.max_proxy_packet_size_v6
        }
    }

    fn wg_tunnel_mtu_for(&self, client_addr: &SocketAddr) -> usize {
        if is_ipv4_family(client_addr) {
            self.wg_tunnel_mtu_v4
        } else {
            self.wg_tunnel_mtu_v6
        }
    }

    async fn recv_from_proxy_generic(
        self: Arc<Self>,
        proxy_socket: Arc<UdpSocket>,
        mut deadline: DeadlineWatcher,
        session_tasks: TaskTracker,
    ) {
        let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
        let mut packets_received: u64 = 0;
        let mut wg_bytes_received: u64 = 0;

        loop {
            let mut buf = self.pool.get();

            let meta = tokio::select! {
                () = deadline.expired() => break,
                res = recv_msg(&proxy_socket, &mut buf, Some(&mut cmsg_buf)) => match res {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            listen_address = %self.proxy_listen,
                            error = %e,
                            "Failed to read from proxy socket"
                        );
                        continue;
                    }
                },
            };

            if let Err(e) = parse_flags_for_error(meta.flags) {
                warn!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %meta.src,
                    packet_length = meta.len,
                    error = %e,
                    "Failed to read from proxy socket"
                );
                continue;
            }

            let (start, len) = match self.handler.decrypt(&mut buf, 0, meta.len) {
                Ok(window) => window,
                Err(e) => {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %meta.src,
                        packet_length = meta.len,
                        error = %e,
                        "Failed to decrypt proxy packet"
                    );
                    continue;
                }
            };

            packets_received += 1;
            wg_bytes_received += len as u64;

            self.handle_wg_packet(
                QueuedPacket { buf, start, len },
                meta.src,
                &cmsg_buf[..meta.cmsg_len],
                &proxy_socket,
                &session_tasks,
            );
        }

        info!(
            server = %self.name,
            listen_address = %self.proxy_listen,
            wg_address = %self.wg_addr,
            packets_received,
            wg_bytes_received,
            "Finished receiving from proxy socket"
        );
    }

    async fn recv_from_proxy_batched(
        self: Arc<Self>,
        proxy_socket: Arc<UdpSocket>,
        mut deadline: DeadlineWatcher,
        session_tasks: TaskTracker,
    ) {
        let batch = self.main_recv_batch_size;
        let mut cmsg_bufs = vec![[0u8; CMSG_BUFFER_SIZE]; batch];
        let mut packets_received: u64 = 0;
        let mut wg_bytes_received: u64 = 0;

        loop {
            let mut bufs: Vec<PooledBuffer> = (0..batch).map(|_| self.pool.get()).collect();

            let metas = tokio::select! {
                () = deadline.expired() => break,
                res = recv_batch(&proxy_socket, &mut bufs, &mut cmsg_bufs) => match res {
                    Ok(metas) => metas,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            listen_address = %self.proxy_listen,
                            error = %e,
                            "Failed to batch-read from proxy socket"
                        );
                        continue;
                    }
                },
            };

            // Unused slots drop with the iterator and return to the pool.
            for (i, (mut buf, meta)) in bufs.into_iter().zip(metas.iter().copied()).enumerate() {
                if let Err(e) = parse_flags_for_error(meta.flags) {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %meta.src,
                        packet_length = meta.len,
                        error = %e,
                        "Failed to read from proxy socket"
                    );
                    continue;
                }

                let (start, len) = match self.handler.decrypt(&mut buf, 0, meta.len) {
                    Ok(window) => window,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            listen_address = %self.proxy_listen,
                            client_address = %meta.src,
                            packet_length = meta.len,
                            error = %e,
                            "Failed to decrypt proxy packet"
                        );
                        continue;
                    }
                };

                packets_received += 1;
                wg_bytes_received += len as u64;

                self.handle_wg_packet(
                    QueuedPacket { buf, start, len },
                    meta.src,
                    &cmsg_bufs[i][..meta.cmsg_len],
                    &proxy_socket,
                    &session_tasks,
                );
            }
        }

        info!(
            server = %self.name,
            listen_address = %self.proxy_listen,
            wg_address = %self.wg_addr,
            packets_received,
            wg_bytes_received,
            "Finished receiving from proxy socket"
        );
    }

    /// Demultiplex one decrypted packet into its session.
    ///
    /// Runs the whole critical section of the ingress iteration: session
    /// lookup or creation, pktinfo compare-and-publish, worker spawn for
    /// fresh sessions, and the non-blocking queue push. Every early return
    /// drops `pkt`, returning its buffer to the pool.
    fn handle_wg_packet(
        self: &Arc<Self>,
        pkt: QueuedPacket,
        client_addr: SocketAddr,
        cmsg: &[u8],
        proxy_socket: &Arc<UdpSocket>,
        session_tasks: &TaskTracker,
    ) {
        let mut table = self.table.lock();

        let mut new_parts = None;
        if !table.contains_key(&client_addr) {
            let wg_socket = match bind_upstream_socket(self.wg_addr, self.wg_fwmark) {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %client_addr,
                        wg_fwmark = self.wg_fwmark,
                        error = %e,
                        "Failed to create upstream socket for new session"
                    );
                    return;
                }
            };

            let (deadline, watcher) = read_deadline(Instant::now() + REJECT_AFTER_TIME);
            let (send_queue, queue_rx) = mpsc::channel(self.send_channel_capacity);

            table.insert(
                client_addr,
                SessionEntry {
                    wg_socket,
                    send_queue,
                    deadline,
                    pktinfo_current: Arc::new(ArcSwap::from_pointee(Vec::new())),
                    pktinfo_cache: Vec::new(),
                    max_proxy_packet_size: self.max_proxy_packet_size_for(&client_addr),
                },
            );
            new_parts = Some((watcher, queue_rx));
        }
        let created = new_parts.is_some();

        let Some(entry) = table.get_mut(&client_addr) else {
            return;
        };

        if entry.pktinfo_cache.as_slice() != cmsg {
            match parse_pktinfo(cmsg) {
                Ok((pktinfo_addr, pktinfo_ifindex)) => {
                    let fresh = cmsg.to_vec();
                    entry.pktinfo_cache.clear();
                    entry.pktinfo_cache.extend_from_slice(&fresh);
                    entry.pktinfo_current.store(Arc::new(fresh));

                    debug!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %client_addr,
                        pktinfo_addr = %pktinfo_addr,
                        pktinfo_ifindex,
                        "Updated client pktinfo"
                    );
                }
                Err(e) => {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %client_addr,
                        error = %e,
                        "Failed to parse pktinfo control message"
                    );
                    // A freshly inserted entry has no workers yet; remove
                    // it so the table never holds a workerless session.
                    if created {
                        table.remove(&client_addr);
                    }
                    return;
                }
            }
        }

        if let Some((watcher, queue_rx)) = new_parts {
            let wg_tunnel_mtu = self.wg_tunnel_mtu_for(&client_addr);

            let reply_worker = Arc::clone(self);
            let wg_socket = Arc::clone(&entry.wg_socket);
            let pktinfo_current = Arc::clone(&entry.pktinfo_current);
            let initial_pktinfo = entry.pktinfo_current.load_full();
            let max_proxy_packet_size = entry.max_proxy_packet_size;
            let reply_proxy_socket = Arc::clone(proxy_socket);
            session_tasks.spawn(async move {
                reply_worker
                    .relay_wg_to_proxy(
                        client_addr,
                        wg_socket,
                        watcher,
                        pktinfo_current,
                        initial_pktinfo,
                        max_proxy_packet_size,
                        reply_proxy_socket,
                    )
                    .await;
            });

            let forward_worker = Arc::clone(self);
            let wg_socket = Arc::clone(&entry.wg_socket);
            let deadline = entry.deadline.clone();
            session_tasks.spawn(async move {
                forward_worker
                    .relay_proxy_to_wg(client_addr, queue_rx, wg_socket, deadline)
                    .await;
            });

            info!(
                server = %self.name,
                listen_address = %self.proxy_listen,
                client_address = %client_addr,
                wg_address = %self.wg_addr,
                wg_tunnel_mtu,
                "New session"
            );
        }

        if let Err(e) = entry.send_queue.try_send(pkt) {
            match e {
                TrySendError::Full(_) => debug!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    "WireGuard packet dropped: send queue full"
                ),
                TrySendError::Closed(_) => debug!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    "WireGuard packet dropped: send queue closed"
                ),
            }
        }
    }

    /// Session worker: drain the send queue into the upstream socket.
    ///
    /// Handshake initiations and responses push the upstream read deadline
    /// forward. Exits when the queue closes, which closes the upstream
    /// socket once the last reference drops.
    async fn relay_proxy_to_wg(
        self: Arc<Self>,
        client_addr: SocketAddr,
        queue_rx: mpsc::Receiver<QueuedPacket>,
        wg_socket: Arc<UdpSocket>,
        deadline: DeadlineHandle,
    ) {
        let (packets_sent, wg_bytes_sent) = match self.batch_mode {
            BatchMode::Generic => {
                self.forward_generic(client_addr, queue_rx, &wg_socket, &deadline)
                    .await
            }
            BatchMode::Sendmmsg => {
                self.forward_batched(client_addr, queue_rx, &wg_socket, &deadline)
                    .await
            }
        };

        info!(
            server = %self.name,
            listen_address = %self.proxy_listen,
            client_address = %client_addr,
            wg_address = %self.wg_addr,
            packets_sent,
            wg_bytes_sent,
            "Finished relay proxy -> wg"
        );
    }

    async fn forward_generic(
        &self,
        client_addr: SocketAddr,
        mut queue_rx: mpsc::Receiver<QueuedPacket>,
        wg_socket: &UdpSocket,
        deadline: &DeadlineHandle,
    ) -> (u64, u64) {
        let mut packets_sent: u64 = 0;
        let mut wg_bytes_sent: u64 = 0;

        while let Some(pkt) = queue_rx.recv().await {
            if let Err(e) = wg_socket.send_to(pkt.packet(), self.wg_addr).await {
                warn!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    error = %e,
                    "Failed to write WireGuard packet to upstream socket"
                );
            }

            self.refresh_on_handshake(pkt.packet(), deadline);

            packets_sent += 1;
            wg_bytes_sent += pkt.len as u64;
        }

        (packets_sent, wg_bytes_sent)
    }

    async fn forward_batched(
        &self,
        client_addr: SocketAddr,
        mut queue_rx: mpsc::Receiver<QueuedPacket>,
        wg_socket: &UdpSocket,
        deadline: &DeadlineHandle,
    ) -> (u64, u64) {
        let mut packets_sent: u64 = 0;
        let mut wg_bytes_sent: u64 = 0;
        let mut batch: Vec<QueuedPacket> = Vec::with_capacity(self.relay_batch_size);

        while let Some(pkt) = queue_rx.recv().await {
            batch.push(pkt);
            while batch.len() < self.relay_batch_size {
                match queue_rx.try_recv() {
                    Ok(pkt) => batch.push(pkt),
                    Err(_) => break,
                }
            }

            {
                let packets: Vec<&[u8]> = batch.iter().map(QueuedPacket::packet).collect();
                if let Err(e) = send_all_batch(wg_socket, &packets, self.wg_addr).await {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %client_addr,
                        wg_address = %self.wg_addr,
                        error = %e,
                        "Failed to batch-write WireGuard packets to upstream socket"
                    );
                }
            }

            for pkt in batch.drain(..) {
                self.refresh_on_handshake(pkt.packet(), deadline);
                packets_sent += 1;
                wg_bytes_sent += pkt.len as u64;
            }
        }

        (packets_sent, wg_bytes_sent)
    }

    /// Push the upstream read deadline forward on handshake traffic.
    ///
    /// Only initiation and response frames count; cookie replies and data
    /// packets do not attest session progress.
    fn refresh_on_handshake(&self, packet: &[u8], deadline: &DeadlineHandle) {
        if let Some(&message_type) = packet.first() {
            if message_type == WIREGUARD_MESSAGE_TYPE_HANDSHAKE_INITIATION
                || message_type == WIREGUARD_MESSAGE_TYPE_HANDSHAKE_RESPONSE
            {
                deadline.set(Instant::now() + REJECT_AFTER_TIME);
            }
        }
    }

    /// Session worker: mirror WireGuard replies back to the client.
    ///
    /// Owns a private scratch buffer for the session's lifetime; the
    /// interior window leaves codec headroom so encryption happens in
    /// place. Exits on deadline expiry, then removes the session from the
    /// table, which closes the send queue.
    #[allow(clippy::too_many_arguments)] // mirrors the per-session state snapshot
    async fn relay_wg_to_proxy(
        self: Arc<Self>,
        client_addr: SocketAddr,
        wg_socket: Arc<UdpSocket>,
        mut deadline: DeadlineWatcher,
        pktinfo_current: Arc<ArcSwap<Vec<u8>>>,
        mut current_pktinfo: Arc<Vec<u8>>,
        max_proxy_packet_size: usize,
        proxy_socket: Arc<UdpSocket>,
    ) {
        let mut packets_sent: u64 = 0;
        let mut wg_bytes_sent: u64 = 0;

        let front_overhead = self.handler.front_overhead();
        let rear_overhead = self.handler.rear_overhead();
        let mut packet_buf = vec![0u8; max_proxy_packet_size];
        let interior_end = max_proxy_packet_size - rear_overhead;

        loop {
            let meta = tokio::select! {
                () = deadline.expired() => break,
                res = recv_msg(
                    &wg_socket,
                    &mut packet_buf[front_overhead..interior_end],
                    None,
                ) => match res {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            listen_address = %self.proxy_listen,
                            client_address = %client_addr,
                            wg_address = %self.wg_addr,
                            error = %e,
                            "Failed to read from upstream socket"
                        );
                        continue;
                    }
                },
            };

            if let Err(e) = parse_flags_for_error(meta.flags) {
                warn!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    packet_length = meta.len,
                    error = %e,
                    "Failed to read from upstream socket"
                );
                continue;
            }

            if !mapped_eq(meta.src, self.wg_addr) {
                warn!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    packet_source_address = %meta.src,
                    packet_length = meta.len,
                    "Ignoring packet from non-wg address"
                );
                continue;
            }

            let (start, len) = match self.handler.encrypt(&mut packet_buf, front_overhead, meta.len)
            {
                Ok(window) => window,
                Err(e) => {
                    warn!(
                        server = %self.name,
                        listen_address = %self.proxy_listen,
                        client_address = %client_addr,
                        wg_address = %self.wg_addr,
                        error = %e,
                        "Failed to encrypt WireGuard packet"
                    );
                    continue;
                }
            };

            let latest = pktinfo_current.load();
            if !Arc::ptr_eq(&latest, &current_pktinfo) {
                current_pktinfo = Arc::clone(&latest);
            }
            drop(latest);

            if let Err(e) = send_msg(
                &proxy_socket,
                &packet_buf[start..start + len],
                &current_pktinfo,
                client_addr,
            )
            .await
            {
                warn!(
                    server = %self.name,
                    listen_address = %self.proxy_listen,
                    client_address = %client_addr,
                    wg_address = %self.wg_addr,
                    error = %e,
                    "Failed to write to proxy socket"
                );
            }

            packets_sent += 1;
            wg_bytes_sent += meta.len as u64;
        }

        {
            let mut table = self.table.lock();
            table.remove(&client_addr);
        }

        info!(
            server = %self.name,
            listen_address = %self.proxy_listen,
            client_address = %client_addr,
            wg_address = %self.wg_addr,
            packets_sent,
            wg_bytes_sent,
            "Finished relay wg -> proxy"
        );
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} relay server", self.name)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("proxy_listen", &self.proxy_listen)
            .field("wg_addr", &self.wg_addr)
            .field("batch_mode", &self.batch_mode)
            .field("running", &self.runtime.lock().is_some())
            .finish_non_exhaustive()
    }
}
