//! Peer discovery over UDP.
//!
//! One socket per bus, bound to the discovery port, both sends and
//! receives. Announcements go out to every configured target (broadcast
//! by default) on a fixed interval; everything heard is fed into the
//! [`PeerRegistry`](crate::registry::PeerRegistry). A third loop evicts
//! peers that stop announcing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

pub mod announce;
pub mod listener;

pub use announce::announce_loop;
pub use listener::{expiry_loop, listener_loop};

/// Bind the discovery socket. Must be called from inside the runtime.
///
/// SO_REUSEADDR so several buses on one host can share the well-known
/// port; SO_BROADCAST so the default broadcast target works.
pub fn bind_discovery_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if addr.is_ipv4() {
        socket.set_broadcast(true).context("SO_BROADCAST")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind({addr})"))?;

    let socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")
}

/// Best guess at the address peers can reach us on.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// source address it would route from.
pub fn detect_local_addr() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            tracing::debug!("no routable interface, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// The address to put in our announcements.
pub fn advertise_addr(host: IpAddr, configured: Option<IpAddr>) -> IpAddr {
    match configured {
        Some(addr) => addr,
        None if host.is_unspecified() => detect_local_addr(),
        None => host,
    }
}
