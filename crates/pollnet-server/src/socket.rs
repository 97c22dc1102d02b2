//! Listening and per-peer socket construction.
//!
//! All sockets returned here are non-blocking and have `SO_REUSEADDR` and
//! `SO_REUSEPORT` set.  Port reuse is what lets the UDP acceptor bind one
//! connected socket per peer on the same local port as the listener.

use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};

use crate::sys;

/// Unanswered keepalive probes before the kernel drops the connection.
const KEEPALIVE_RETRIES: u32 = 3;

fn new_socket(addr: SocketAddr, ty: Type, proto: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(proto))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Creates, binds and listens a TCP socket.
pub(crate) fn tcp_listener(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Creates and binds the UDP socket that receives first datagrams.
pub(crate) fn udp_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Creates a UDP socket bound to `local` and connected to `peer`.
///
/// Once connected, the kernel delivers datagrams from `peer` to this socket
/// instead of the shared listener.
pub(crate) fn udp_peer(local: SocketAddr, peer: SocketAddr) -> io::Result<Socket> {
    let socket = new_socket(local, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(socket)
}

/// Prepares an accepted TCP socket: non-blocking, no Nagle delay, optional
/// keepalive.
pub(crate) fn prepare_accepted(socket: Socket, keepalive: Option<Duration>) -> io::Result<Socket> {
    socket.set_nonblocking(true)?;
    sys::set_nosigpipe(socket.as_raw_fd())?;

    let stream = TcpStream::from(socket);
    stream.set_nodelay(true)?;
    let socket = Socket::from(stream);

    if let Some(idle) = keepalive {
        let params = TcpKeepalive::new()
            .with_time(idle)
            .with_interval(idle)
            .with_retries(KEEPALIVE_RETRIES);
        socket.set_tcp_keepalive(&params)?;
    }
    Ok(socket)
}

/// Converts a socket2 address, rejecting non-IP families.
pub(crate) fn to_socket_addr(addr: &SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an IP socket address"))
}

/// The bound address of a socket (resolves port 0).
pub(crate) fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    to_socket_addr(&socket.local_addr()?)
}
