//! Network plumbing for the relay
//!
//! This module wraps the OS-level pieces the relay core is built on:
//!
//! - `addr`: endpoint resolution and IPv4-mapped-IPv6 normalization
//! - `deadline`: injectable read deadlines, the relay's only
//!   cancellation mechanism
//! - `pktinfo`: `recvmsg`/`sendmsg` with ancillary (pktinfo) data
//! - `socket`: proxy and upstream UDP socket construction

mod addr;
mod deadline;
mod pktinfo;
mod socket;

pub use addr::{canonical, is_ipv4_family, mapped_eq, resolve_endpoint};
pub use deadline::{read_deadline, DeadlineHandle, DeadlineWatcher};
pub use pktinfo::{
    parse_flags_for_error, parse_pktinfo, recv_msg, send_msg, RecvMeta, CMSG_BUFFER_SIZE,
};
pub use socket::{bind_proxy_socket, bind_upstream_socket};

pub(crate) use pktinfo::{sockaddr_storage_from, socket_addr_from_storage};
