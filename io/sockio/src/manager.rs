//! The socket manager: descriptor table, control channel, and the watcher
//! thread that turns kernel readiness into internal dispatch events.
//!
//! One long-lived watcher blocks in `mio::Poll`. Everything else talks to it
//! through pokes: a control message on an unbounded channel followed by a
//! waker kick. A poked descriptor gets its watch interest recomputed from
//! its queue state; a ready descriptor gets an internal event posted to the
//! task owning its head request, and its interest dropped until the handler
//! pokes again. Interest is therefore re-armed on every pass, which keeps
//! the observable behaviour level-triggered on an edge-triggered backend.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::error::SockError;
use crate::socket::{Family, SockState, Socket, SocketCore, SocketType};

const WAKER_TOKEN: Token = Token(0);

/// A control message to the watcher.
pub(crate) enum Poke {
    Shutdown,
    Fd(RawFd),
}

/// Lifecycle of a managed descriptor. A closed descriptor simply leaves the
/// table.
enum FdState {
    Managed,
    ClosePending,
}

struct FdEntry {
    state: FdState,
    sock: Option<Arc<SocketCore>>,
    read_watched: bool,
    write_watched: bool,
}

struct MgrState {
    fds: AHashMap<RawFd, FdEntry>,
    nsockets: usize,
}

/// State shared between the manager handle, its sockets, and the watcher.
pub(crate) struct Shared {
    lock: Mutex<MgrState>,
    shutdown_ok: Condvar,
    ctl_tx: Sender<Poke>,
    waker: Waker,
}

impl Shared {
    fn poke(&self, msg: Poke) {
        if self.ctl_tx.send(msg).is_err() {
            // Watcher already gone; nothing left to wake.
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "waking the watcher failed");
        }
    }

    pub(crate) fn poke_fd(&self, fd: RawFd) {
        self.poke(Poke::Fd(fd));
    }

    /// Register a descriptor as managed. Watch interest stays off until the
    /// first poke finds queued work.
    pub(crate) fn publish(&self, fd: RawFd, sock: Arc<SocketCore>) {
        let mut st = self.lock.lock();
        st.fds.insert(
            fd,
            FdEntry {
                state: FdState::Managed,
                sock: Some(sock),
                read_watched: false,
                write_watched: false,
            },
        );
        st.nsockets += 1;
        trace!(fd, nsockets = st.nsockets, "descriptor managed");
    }

    /// A socket's last reference is gone: flag its descriptor for the
    /// watcher to unwatch and close.
    pub(crate) fn retire(&self, fd: RawFd) {
        let mut st = self.lock.lock();
        if let Some(entry) = st.fds.get_mut(&fd) {
            entry.state = FdState::ClosePending;
            entry.sock = None;
        }
        st.nsockets -= 1;
        trace!(fd, nsockets = st.nsockets, "descriptor retiring");
        if st.nsockets == 0 {
            self.shutdown_ok.notify_all();
        }
        drop(st);
        self.poke(Poke::Fd(fd));
    }
}

/// The process-visible socket manager. Owns the descriptor table and the
/// watcher thread; creates sockets.
pub struct SocketManager {
    shared: Arc<Shared>,
    watcher: Option<thread::JoinHandle<()>>,
}

impl SocketManager {
    /// Create a manager and start its watcher thread.
    pub fn new() -> Result<SocketManager, SockError> {
        let poll = Poll::new().map_err(create_error)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(create_error)?;
        let (ctl_tx, ctl_rx) = unbounded();

        let shared = Arc::new(Shared {
            lock: Mutex::new(MgrState {
                fds: AHashMap::new(),
                nsockets: 0,
            }),
            shutdown_ok: Condvar::new(),
            ctl_tx,
            waker,
        });

        let watcher_shared = shared.clone();
        let watcher = thread::Builder::new()
            .name("sockio-watcher".to_string())
            .spawn(move || watcher_loop(watcher_shared, poll, ctl_rx))
            .map_err(create_error)?;

        debug!("socket manager started");
        Ok(SocketManager {
            shared,
            watcher: Some(watcher),
        })
    }

    /// Create a managed, non-blocking socket. UDP sockets have the kernel
    /// receive timestamp enabled, and packet-info delivery on IPv6.
    pub fn socket(&self, family: Family, ty: SocketType) -> Result<Socket, SockError> {
        let domain = match family {
            Family::V4 => socket2::Domain::IPV4,
            Family::V6 => socket2::Domain::IPV6,
        };
        let (stype, proto) = match ty {
            SocketType::Udp => (socket2::Type::DGRAM, socket2::Protocol::UDP),
            SocketType::Tcp => (socket2::Type::STREAM, socket2::Protocol::TCP),
        };

        let sock2 = socket2::Socket::new(domain, stype, Some(proto)).map_err(create_error)?;
        sock2.set_nonblocking(true).map_err(create_error)?;
        let fd = sock2.into_raw_fd();

        if ty == SocketType::Udp {
            let on: libc::c_int = 1;
            unsafe {
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMP,
                    &on as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&on) as libc::socklen_t,
                ) < 0
                {
                    warn!(fd, "setsockopt(SO_TIMESTAMP) failed");
                    // Press on; completions just lose timestamps.
                }
                if family == Family::V6
                    && libc::setsockopt(
                        fd,
                        libc::IPPROTO_IPV6,
                        libc::IPV6_RECVPKTINFO,
                        &on as *const _ as *const libc::c_void,
                        std::mem::size_of_val(&on) as libc::socklen_t,
                    ) < 0
                {
                    warn!(fd, "setsockopt(IPV6_RECVPKTINFO) failed");
                }
            }
        }

        let core = Arc::new(SocketCore {
            manager: self.shared.clone(),
            ty,
            state: Mutex::new(SockState::new(fd)),
        });
        core.state.lock().references = 1;
        self.shared.publish(fd, core.clone());
        trace!(fd, ?ty, "socket created");
        Ok(Socket { core })
    }

    /// Shut the manager down. Blocks until every socket has been released,
    /// then stops the watcher and closes anything it left behind.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(handle) = self.watcher.take() else {
            return;
        };

        {
            let mut st = self.shared.lock.lock();
            while st.nsockets != 0 {
                self.shared.shutdown_ok.wait(&mut st);
            }
        }

        self.shared.poke(Poke::Shutdown);
        if handle.join().is_err() {
            warn!("watcher thread panicked");
        }

        // Close descriptors whose retirement the watcher never processed.
        let mut st = self.shared.lock.lock();
        for (fd, entry) in st.fds.drain() {
            if matches!(entry.state, FdState::ClosePending) {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        debug!("socket manager stopped");
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn create_error(e: io::Error) -> SockError {
    match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) => SockError::NoResources,
        _ => {
            warn!(error = %e, "socket setup failed");
            SockError::Unexpected
        }
    }
}

fn interest_of(read: bool, write: bool) -> Interest {
    match (read, write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("no interest requested"),
    }
}

/// Bring the kernel registration for `fd` in line with the wanted interest.
fn sync_interest(
    registry: &Registry,
    fd: RawFd,
    entry: &mut FdEntry,
    want_read: bool,
    want_write: bool,
) {
    if entry.read_watched == want_read && entry.write_watched == want_write {
        return;
    }
    let had = entry.read_watched || entry.write_watched;
    let mut source = SourceFd(&fd);
    let token = Token(fd as usize + 1);

    let res = if !had {
        registry.register(&mut source, token, interest_of(want_read, want_write))
    } else if !want_read && !want_write {
        registry.deregister(&mut source)
    } else {
        registry.reregister(&mut source, token, interest_of(want_read, want_write))
    };
    if let Err(e) = res {
        warn!(fd, error = %e, "updating watch interest failed");
    }

    entry.read_watched = want_read;
    entry.write_watched = want_write;
}

fn close_now(st: &mut MgrState, registry: &Registry, fd: RawFd) {
    if let Some(entry) = st.fds.get_mut(&fd) {
        sync_interest(registry, fd, entry, false, false);
    }
    unsafe {
        libc::close(fd);
    }
    st.fds.remove(&fd);
    trace!(fd, "watcher closed descriptor");
}

/// A poked descriptor: close it if it is retiring, otherwise recompute its
/// watch interest from queue state. Read interest wants unserved receive or
/// accept work with no dispatch in flight; write interest wants unserved
/// send work, or a connect in progress.
fn handle_poke(st: &mut MgrState, registry: &Registry, fd: RawFd) {
    let Some(entry) = st.fds.get_mut(&fd) else {
        return;
    };
    if matches!(entry.state, FdState::ClosePending) {
        close_now(st, registry, fd);
        return;
    }

    let sock = entry.sock.clone().expect("managed entry without socket");
    let sst = sock.state.lock();
    let want_read = (!sst.recv_list.is_empty() || !sst.accept_list.is_empty())
        && !sst.pending_recv
        && !sst.pending_accept;
    let want_write = (!sst.send_list.is_empty() && !sst.pending_send) || sst.connecting;
    drop(sst);
    sync_interest(registry, fd, entry, want_read, want_write);
}

/// A ready descriptor: dispatch the appropriate internal event and drop the
/// direction's interest until the handler re-pokes.
fn handle_ready(st: &mut MgrState, registry: &Registry, fd: RawFd, readable: bool, writable: bool) {
    let Some(entry) = st.fds.get_mut(&fd) else {
        return;
    };
    if matches!(entry.state, FdState::ClosePending) {
        close_now(st, registry, fd);
        return;
    }

    let sock = entry.sock.clone().expect("managed entry without socket");
    let mut want_read = entry.read_watched;
    let mut want_write = entry.write_watched;
    {
        let mut sst = sock.state.lock();
        if sst.references > 0 {
            if readable {
                if sst.listener {
                    sock.dispatch_accept(&mut sst);
                } else {
                    sock.dispatch_read(&mut sst);
                }
                want_read = false;
            }
            if writable {
                if sst.connecting {
                    sock.dispatch_connect(&mut sst);
                } else {
                    sock.dispatch_write(&mut sst);
                }
                want_write = false;
            }
        } else {
            // Raced with the last detach; retirement is on its way.
            want_read = false;
            want_write = false;
        }
    }
    sync_interest(registry, fd, entry, want_read, want_write);
}

fn watcher_loop(shared: Arc<Shared>, mut poll: Poll, ctl_rx: Receiver<Poke>) {
    let mut events = Events::with_capacity(1024);
    let mut done = false;

    while !done {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "readiness poll failed, watcher exiting");
            return;
        }


        let registry = poll.registry();
        let mut st = shared.lock.lock();

        // Drain control messages first: they retire descriptors and adjust
        // interest before the readiness scan.
        if events.iter().any(|ev| ev.token() == WAKER_TOKEN) {
            loop {
                match ctl_rx.try_recv() {
                    Ok(Poke::Shutdown) => {
                        // Finish this pass; the loop exits after it.
                        done = true;
                        break;
                    }
                    Ok(Poke::Fd(fd)) => handle_poke(&mut st, registry, fd),
                    Err(_) => break,
                }
            }
        }

        for ev in events.iter() {
            let token = ev.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let fd = (token.0 - 1) as RawFd;
            handle_ready(&mut st, registry, fd, ev.is_readable(), ev.is_writable());
        }
    }

    trace!("watcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_starts_and_stops() {
        let manager = SocketManager::new().unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_two_managers_coexist() {
        let first = SocketManager::new().unwrap();
        let second = SocketManager::new().unwrap();
        let a = first.socket(Family::V4, SocketType::Udp).unwrap();
        let b = second.socket(Family::V4, SocketType::Udp).unwrap();
        a.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        b.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        drop(a);
        drop(b);
        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn test_socket_create_and_release() {
        let manager = SocketManager::new().unwrap();
        {
            let sock = manager.socket(Family::V4, SocketType::Tcp).unwrap();
            assert_eq!(sock.socket_type(), SocketType::Tcp);
            let clone = sock.clone();
            drop(sock);
            // The clone still holds the socket open.
            assert_eq!(clone.socket_type(), SocketType::Tcp);
        }
        manager.shutdown();
    }
}
