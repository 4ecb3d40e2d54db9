//! Socket construction helpers shared by [`crate::client`] and
//! [`crate::server`].

use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};

/// Binds a non-blocking UDP socket with `SO_REUSEADDR` set, the way the
/// server needs to (so a restarted server can rebind its port immediately).
/// `flux-network` reaches for raw `libc::setsockopt` for simpler buffer-size
/// tuning; `SO_REUSEADDR` needs to be set before `bind`, which is the
/// purpose-built `socket2` crate's job.
pub(crate) fn bind_reuseaddr(addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}

/// Opens a non-blocking UDP socket and connects it to `remote`, so
/// subsequent `send`/`recv` calls default to that peer without specifying
/// an address each time.
pub(crate) fn connect(remote: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&remote.into())?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}
