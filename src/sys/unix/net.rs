//! Raw socket system-call wrappers.
//!
//! This is the small, named set of operations the core consumes from the
//! operating system: create a non-blocking stream socket, bind, listen,
//! accept, connect, shutdown-write, read addresses, read the pending socket
//! error, and the handful of `setsockopt` toggles the core cares about.
//! Nothing above this module ever calls a raw `libc::` socket function
//! directly.

use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn sockaddr_in(addr: SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
        sin_len: 0,
    };
    (sin, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

fn addr_from_sockaddr_in(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
    SocketAddrV4::new(ip, u16::from_be(sin.sin_port))
}

/// Creates a non-blocking, close-on-exec TCP (`SOCK_STREAM`) socket.
///
/// Fatal per spec §7: if the kernel cannot hand out a socket fd here there
/// is no way for the core to make progress, so the caller should treat this
/// as a setup failure.
pub fn new_stream_socket() -> io::Result<OwnedFd> {
    let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, ty, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let (sin, len) = sockaddr_in(addr);
    cvt(unsafe { libc::bind(fd, &sin as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

/// Enters the listening state with a backlog of `SOMAXCONN`.
pub fn listen(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, libc::SOMAXCONN) })?;
    Ok(())
}

/// Accepts one pending connection, returning the new non-blocking,
/// close-on-exec socket and the peer's address.
///
/// Returns `WouldBlock` if nothing is pending; the caller is expected to
/// treat `EAGAIN`, `ECONNABORTED`, `EINTR`, `EPROTO`, `EPERM`, and `EMFILE`
/// as transient per spec §7.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddrV4)> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ty = libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let accepted = cvt(unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            ty,
        )
    })?;
    let peer = addr_from_sockaddr_in(&storage);
    Ok((unsafe { OwnedFd::from_raw_fd(accepted) }, peer))
}

/// Issues a non-blocking `connect`. The raw return is passed back to the
/// caller so the connector can classify it (see spec §4.7); a `-1` return
/// with `errno` left in place is not itself treated as failure here.
pub fn connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let (sin, len) = sockaddr_in(addr);
    let ret = unsafe { libc::connect(fd, &sin as *const _ as *const libc::sockaddr, len) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_WR) })?;
    Ok(())
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(addr_from_sockaddr_in(&storage))
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    cvt(unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(addr_from_sockaddr_in(&storage))
}

/// Reads and clears the socket's pending `SO_ERROR`. Used both by
/// `handleError` (spec §4.8) and the connector's write-ready classification
/// (spec §4.7).
pub fn take_socket_error(fd: RawFd) -> io::Result<i32> {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    })?;
    Ok(optval)
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: bool) -> io::Result<()> {
    let val: libc::c_int = value as libc::c_int;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd, value: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, value)
}

pub fn set_reuseport(fd: RawFd, value: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, value)
}

pub fn set_keepalive(fd: RawFd, value: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, value)
}

pub fn set_nodelay(fd: RawFd, value: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, value)
}

/// A scatter read of up to `bufs.len()` buffers in one system call.
pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    let n = cvt_isize(unsafe {
        libc::readv(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int)
    } as isize)?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = cvt_isize(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })?;
    Ok(n as usize)
}

fn cvt_isize(ret: libc::ssize_t) -> io::Result<libc::ssize_t> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn as_raw(fd: &OwnedFd) -> RawFd {
    fd.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_listen_accept_connect_roundtrip() {
        let listener = new_stream_socket().unwrap();
        let lfd = as_raw(&listener);
        set_reuseaddr(lfd, true).unwrap();
        bind(lfd, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listen(lfd).unwrap();
        let addr = local_addr(lfd).unwrap();
        assert_ne!(addr.port(), 0);

        let client = new_stream_socket().unwrap();
        let cfd = as_raw(&client);
        match connect(cfd, addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => panic!("unexpected connect error: {e}"),
        }

        // Give the kernel a moment to complete the loopback handshake.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let (accepted, _peer) = accept(lfd).unwrap();
        assert!(as_raw(&accepted) >= 0);
    }
}
