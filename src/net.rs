//! Raw-socket plumbing: non-blocking connect and `poll`-based readiness
//! waits. `std::net::TcpStream` has no portable non-blocking connect, so
//! the initial connect is built directly on `libc` and the resulting fd
//! is handed back as an ordinary `TcpStream` for the rest of its life.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::{Duration, Instant};

use std::net::TcpStream;

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Open a non-blocking socket, start connecting to `addr`, and wait for
/// writable readiness up to `timeout`. Returns a [`TcpStream`] already in
/// non-blocking mode, connected and verified error-free via `SO_ERROR`.
pub fn connect_nonblocking(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        unsafe { libc::close(fd) };
        return Err(last_os_error());
    }

    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    match wait_writable_fd(fd, timeout) {
        Ok(true) => {}
        Ok(false) => {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        Err(e) => {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    }

    let mut sock_err: libc::c_int = 0;
    let mut sock_err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut sock_err as *mut _ as *mut libc::c_void,
            &mut sock_err_len,
        )
    };
    if rc < 0 {
        unsafe { libc::close(fd) };
        return Err(last_os_error());
    }
    if sock_err != 0 {
        unsafe { libc::close(fd) };
        return Err(io::Error::from_raw_os_error(sock_err));
    }

    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

fn poll_one(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd { fd, events, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            // let the subsequent read/getsockopt surface the real error
            return Ok(true);
        }
        return Ok(pfd.revents & events != 0);
    }
}

/// Block until `fd` is readable or `timeout` elapses. `Ok(false)` means
/// the wait timed out.
pub fn wait_readable_fd(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLIN, timeout)
}

/// Block until `fd` is writable or `timeout` elapses. `Ok(false)` means
/// the wait timed out.
pub fn wait_writable_fd(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLOUT, timeout)
}
