//! Shared listening socket
//!
//! One socket is bound per supervisor lifetime. Workers never bind their
//! own: a forked worker inherits the descriptor, a re-executed worker
//! receives its number through the environment. Every accept, from any
//! process, draws from the same kernel backlog.
//!
//! `SO_REUSEPORT` is deliberately not set; it would give each process a
//! private queue instead of one shared one.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::error::ListenError;

/// Owner of the bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct SharedListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl SharedListener {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, ListenError> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        let raw = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if raw < 0 {
            return Err(ListenError::Socket(io::Error::last_os_error()));
        }
        // SAFETY: socket() just returned this descriptor to us.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let opt: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(ListenError::Configure(io::Error::last_os_error()));
        }

        let (storage, len) = raw_sockaddr(&addr);
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret != 0 {
            return Err(ListenError::Bind { addr, source: io::Error::last_os_error() });
        }

        if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
            return Err(ListenError::Listen { addr, source: io::Error::last_os_error() });
        }

        let inner = TcpListener::from(fd);
        let local_addr = inner.local_addr().map_err(ListenError::Configure)?;
        tracing::info!(%local_addr, backlog, "Listening");

        Ok(Self { inner, local_addr })
    }

    /// Adopt a listening socket handed down by the supervisor.
    ///
    /// # Safety
    ///
    /// `fd` must be open and owned by nobody else in this process; the
    /// returned listener closes it on drop.
    pub unsafe fn from_inherited_fd(fd: RawFd) -> Result<Self, ListenError> {
        if !is_listening_socket(fd) {
            return Err(ListenError::InvalidFd(fd));
        }
        let owned = OwnedFd::from_raw_fd(fd);

        // Nothing below us should inherit it again.
        fcntl(owned.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| ListenError::Configure(e.into()))?;

        let inner = TcpListener::from(owned);
        inner.set_nonblocking(true).map_err(ListenError::Configure)?;
        let local_addr = inner.local_addr().map_err(ListenError::Configure)?;
        Ok(Self { inner, local_addr })
    }

    /// Second descriptor for the identical socket (`dup`).
    pub fn try_clone(&self) -> Result<Self, ListenError> {
        let inner = self.inner.try_clone().map_err(ListenError::Configure)?;
        Ok(Self { inner, local_addr: self.local_addr })
    }

    /// Capability handed to spawners and workers.
    pub fn handle(&self) -> ListenerHandle<'_> {
        ListenerHandle { listener: self }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Non-blocking accept.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }
}

impl AsFd for SharedListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for SharedListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Borrowed access to the shared socket.
///
/// It can accept and be passed to a child, but never closes the socket.
#[derive(Debug, Clone, Copy)]
pub struct ListenerHandle<'a> {
    listener: &'a SharedListener,
}

impl<'a> ListenerHandle<'a> {
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr
    }

    pub fn as_fd(&self) -> BorrowedFd<'a> {
        self.listener.inner.as_fd()
    }

    /// Descriptor number, as passed to a re-executed worker.
    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

fn is_listening_socket(fd: RawFd) -> bool {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut val as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    ret == 0 && val == 1
}

fn raw_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn accept_within(handle: ListenerHandle<'_>, limit: Duration) -> (TcpStream, SocketAddr) {
        let deadline = Instant::now() + limit;
        loop {
            match handle.accept() {
                Ok(pair) => return pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.handle().local_addr(), listener.local_addr());
    }

    #[test]
    fn test_nonblocking_accept() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_clones_share_backlog() {
        let original = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let clone = original.try_clone().unwrap();
        assert_ne!(original.as_raw_fd(), clone.as_raw_fd());

        let addr = original.local_addr();
        let c1 = TcpStream::connect(addr).unwrap();
        let c2 = TcpStream::connect(addr).unwrap();

        let (_, peer_a) = accept_within(original.handle(), Duration::from_secs(2));
        let (_, peer_b) = accept_within(clone.handle(), Duration::from_secs(2));

        let mut peers = vec![peer_a, peer_b];
        peers.sort();
        let mut expected = vec![c1.local_addr().unwrap(), c2.local_addr().unwrap()];
        expected.sort();
        assert_eq!(peers, expected);
    }

    #[test]
    fn test_port_in_use() {
        let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupant.local_addr().unwrap();
        let err = SharedListener::bind(addr, 16).unwrap_err();
        assert!(matches!(err, ListenError::Bind { .. }));
    }

    #[test]
    fn test_inherited_fd_must_listen() {
        let file = tempfile::tempfile().unwrap();
        let err = unsafe { SharedListener::from_inherited_fd(file.as_raw_fd()) }.unwrap_err();
        assert!(matches!(err, ListenError::InvalidFd(_)));
    }

    #[test]
    fn test_ipv6_loopback() {
        // Hosts without IPv6 cannot bind ::1; nothing to check there.
        if let Ok(listener) = SharedListener::bind("[::1]:0".parse().unwrap(), 8) {
            assert!(listener.local_addr().is_ipv6());
        }
    }
}
