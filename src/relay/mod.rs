//! The relay core: session table, ingress loop, and per-session workers
//!
//! A [`Server`] owns one proxy-side listen socket. Each remote client gets
//! a session with its own upstream socket toward the configured WireGuard
//! endpoint and two workers: one draining the session's send queue toward
//! WireGuard, one mirroring WireGuard replies back to the client. Sessions
//! end when the upstream read deadline fires, either from idleness or from
//! [`Server::stop`] injecting it.

use std::time::Duration;

mod server;
mod session;

pub use server::Server;

/// Minimum accepted interface MTU (the IPv6 minimum link MTU)
pub const MINIMUM_MTU: usize = 1280;

/// IPv4 header length in bytes
pub const IPV4_HEADER_LENGTH: usize = 20;

/// IPv6 header length in bytes
pub const IPV6_HEADER_LENGTH: usize = 40;

/// UDP header length in bytes
pub const UDP_HEADER_LENGTH: usize = 8;

/// Per-packet overhead of a WireGuard data packet (header + auth tag)
pub const WIREGUARD_DATA_PACKET_OVERHEAD: usize = 32;

/// WireGuard data packets are padded to multiples of 16 bytes
pub const WIREGUARD_DATA_PACKET_LENGTH_MASK: usize = !0xf;

/// WireGuard message type: handshake initiation
pub const WIREGUARD_MESSAGE_TYPE_HANDSHAKE_INITIATION: u8 = 1;

/// WireGuard message type: handshake response
pub const WIREGUARD_MESSAGE_TYPE_HANDSHAKE_RESPONSE: u8 = 2;

/// WireGuard message type: cookie reply
pub const WIREGUARD_MESSAGE_TYPE_COOKIE_REPLY: u8 = 3;

/// WireGuard message type: data
pub const WIREGUARD_MESSAGE_TYPE_DATA: u8 = 4;

/// WireGuard's session-idle threshold, used as the upstream read-deadline
/// horizon. A session with no handshake for this long is dead.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
