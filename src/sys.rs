//! Socket primitives and platform shims: non-blocking and Nagle toggles,
//! SIGPIPE suppression, the self-pipe used for cross-thread wake-ups and the
//! raw connection and acceptor factories.

use std::io;
use std::mem::ManuallyDrop;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::ptr;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::NetworkError;
use crate::resolve::{native_address, Protocol};

/// Kernel socket or file descriptor.
pub type NativeHandle = RawFd;

/// Sentinel for "no descriptor".
pub const INVALID_NATIVE_HANDLE: NativeHandle = -1;

// SIGPIPE is suppressed per send on platforms without SO_NOSIGPIPE
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0;

/// Borrows a raw descriptor as a [`Socket`] without taking ownership.
fn borrow_socket(fd: NativeHandle) -> ManuallyDrop<Socket> {
    ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) })
}

/// Toggles `O_NONBLOCK` on a descriptor.
pub fn nonblocking(fd: NativeHandle, enable: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enable { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Puts an adopted socket into the shape the loop requires: non-blocking,
/// Nagle disabled and SIGPIPE suppressed where the socket option exists.
pub fn prepare_socket(fd: NativeHandle) -> io::Result<()> {
    let socket = borrow_socket(fd);
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;
    Ok(())
}

/// Closes a descriptor, ignoring errors.
pub fn close_socket(fd: NativeHandle) {
    if fd != INVALID_NATIVE_HANDLE {
        unsafe { libc::close(fd) };
    }
}

/// Shuts down the read direction of a connected socket.
pub fn shutdown_read(fd: NativeHandle) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_RD) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One non-blocking `recv` into `buf` with three outcomes: bytes arrived,
/// nothing to read yet (`Ok(0)`), or the read direction is dead. An orderly
/// shutdown by the peer reports as an error so callers only branch on `Err`
/// for the failure path.
pub fn read_some(fd: NativeHandle, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    match res {
        0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
        res if res < 0 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err)
            }
        }
        res => Ok(res as usize),
    }
}

/// One non-blocking `send` from `buf`.
pub fn write_some(fd: NativeHandle, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// One non-blocking `accept`. Returns `Ok(None)` when no connection is
/// pending.
pub fn try_accept(fd: NativeHandle) -> io::Result<Option<NativeHandle>> {
    let res = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(res))
}

/// Creates the wake-up channel as a `(read, write)` descriptor pair.
///
/// An anonymous pipe on POSIX. Hosts whose readiness primitive cannot watch
/// pipes use [`loopback_socket_pair`] instead; both satisfy the same
/// contract and the loop never distinguishes them.
pub fn create_pipe() -> io::Result<(NativeHandle, NativeHandle)> {
    let mut fds = [INVALID_NATIVE_HANDLE; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Synthesizes a pipe-like descriptor pair from a self-connected TCP
/// loopback connection: bind a listener to an ephemeral loopback port,
/// connect a client to it, accept the server side and drop the listener.
/// Intermediate sockets are released on any failure with the failing call's
/// error preserved.
pub fn loopback_socket_pair() -> io::Result<(NativeHandle, NativeHandle)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    let read_end = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
    let (write_end, _) = listener.accept()?;
    read_end.set_nodelay(true)?;
    write_end.set_nodelay(true)?;
    Ok((read_end.into_raw_fd(), write_end.into_raw_fd()))
}

fn domain_of(proto: Protocol) -> Domain {
    match proto {
        Protocol::Ipv4 => Domain::IPV4,
        Protocol::Ipv6 => Domain::IPV6,
    }
}

/// Resolves `host` and opens a blocking TCP connection to it. When the
/// resolved address is IPv6 and the connection attempt fails, one retry with
/// an explicit IPv4 preference is made before giving up.
pub fn new_tcp_connection(
    host: &str,
    port: u16,
    preferred: Option<Protocol>,
) -> Result<NativeHandle, NetworkError> {
    let (addr, proto) =
        native_address(host, preferred).ok_or_else(|| NetworkError::Resolution(host.to_owned()))?;
    let socket = Socket::new(domain_of(proto), Type::STREAM, Some(socket2::Protocol::TCP))?;
    match socket.connect(&SockAddr::from(SocketAddr::new(addr, port))) {
        Ok(()) => Ok(socket.into_raw_fd()),
        Err(_) if proto == Protocol::Ipv6 && preferred != Some(Protocol::Ipv4) => {
            new_tcp_connection(host, port, Some(Protocol::Ipv4))
        }
        Err(err) => Err(NetworkError::Connect { host: host.to_owned(), source: err }),
    }
}

/// Creates a bound and listening TCP socket. With no bind address the socket
/// binds to the IPv6 wildcard and also accepts IPv4-mapped requests. Returns
/// the descriptor together with the actually bound port, which matters when
/// `port` is `0` (ephemeral).
pub fn new_tcp_acceptor_impl(
    port: u16,
    addr: Option<&str>,
    reuse_addr: bool,
) -> Result<(NativeHandle, u16), NetworkError> {
    let (ip, proto) = match addr {
        Some(host) => {
            native_address(host, None).ok_or_else(|| NetworkError::InvalidAddress(host.to_owned()))?
        }
        None => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), Protocol::Ipv6),
    };
    let socket = Socket::new(domain_of(proto), Type::STREAM, Some(socket2::Protocol::TCP))?;
    if reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if proto == Protocol::Ipv6 && addr.is_none() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&SockAddr::from(SocketAddr::new(ip, port)))?;
    socket.listen(libc::SOMAXCONN)?;
    let bound_port = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::other("acceptor bound to a non-inet address"))?
        .port();
    Ok((socket.into_raw_fd(), bound_port))
}

/// Local address of a bound descriptor.
pub fn local_addr_of(fd: NativeHandle) -> io::Result<SocketAddr> {
    borrow_socket(fd)
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::other("not an inet socket"))
}

/// Local port of a bound descriptor.
pub fn local_port_of(fd: NativeHandle) -> io::Result<u16> {
    Ok(local_addr_of(fd)?.port())
}

/// Peer address of a connected descriptor.
pub fn remote_addr_of(fd: NativeHandle) -> io::Result<SocketAddr> {
    borrow_socket(fd)
        .peer_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::other("not an inet socket"))
}

/// Peer port of a connected descriptor.
pub fn remote_port_of(fd: NativeHandle) -> io::Result<u16> {
    Ok(remote_addr_of(fd)?.port())
}
