//! Sockets: per-endpoint state, the public operation surface, the
//! non-blocking I/O primitives, and the internal readiness handlers the
//! watcher dispatches onto tasks.
//!
//! Every transfer request carries its own completion event. Submission
//! attempts the I/O inline when the direction's queue is empty; anything the
//! kernel cannot finish immediately is queued FIFO and drained by the
//! internal handlers as readiness arrives. Completion events for one socket
//! and direction are posted in submission order.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use taskio::{Direction, Notify, Task};
use tracing::{trace, warn};

use crate::addr::{addr_to_sockaddr, sockaddr_to_addr};
use crate::buffer::IoBuffer;
use crate::error::SockError;
use crate::event::{CancelFlags, EventAttrs, EventKind, IoPayload, Pktinfo, SocketEvent, Timestamp};
use crate::manager::Shared;
use crate::msghdr::{
    CmsgBuf, MAX_RECV_IOV, MAX_SCATTER_GATHER, build_recv, build_send, commit_recv, process_cmsg,
};

/// Transport type of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Udp,
    Tcp,
}

/// Address family for socket creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

pub(crate) type Action = Box<dyn FnOnce(SocketEvent) + Send + 'static>;

/// A queued transfer or marker request.
pub(crate) struct Request {
    pub(crate) kind: EventKind,
    pub(crate) task: Task,
    pub(crate) action: Action,
    pub(crate) payload: Option<IoPayload>,
    pub(crate) n: usize,
    pub(crate) minimum: usize,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) pktinfo: Option<Pktinfo>,
    pub(crate) timestamp: Option<Timestamp>,
    pub(crate) attributes: EventAttrs,
}

impl Request {
    fn new(kind: EventKind, task: Task, action: Action) -> Self {
        Request {
            kind,
            task,
            action,
            payload: None,
            n: 0,
            minimum: 0,
            address: None,
            pktinfo: None,
            timestamp: None,
            attributes: EventAttrs::empty(),
        }
    }
}

/// A queued accept. The new socket is allocated up front so the handler only
/// has to install a descriptor into it.
pub(crate) struct AcceptRequest {
    pub(crate) task: Task,
    pub(crate) action: Action,
    pub(crate) nsock: Arc<SocketCore>,
}

/// The single pending connect.
pub(crate) struct ConnectRequest {
    pub(crate) task: Task,
    pub(crate) action: Action,
}

/// Which handler a writable dispatch is aimed at. Set by the watcher when it
/// posts the internal event, read by the handler; the same slot the
/// pre-allocated writable event's action occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteAction {
    Send,
    Connect,
}

pub(crate) struct SockState {
    pub(crate) fd: RawFd,
    /// External handles + queued requests + in-flight internal events.
    pub(crate) references: usize,
    pub(crate) recv_result: Result<(), SockError>,
    pub(crate) send_result: Result<(), SockError>,
    pub(crate) recv_list: VecDeque<Request>,
    pub(crate) send_list: VecDeque<Request>,
    pub(crate) accept_list: VecDeque<AcceptRequest>,
    pub(crate) connect_ev: Option<ConnectRequest>,
    pub(crate) pending_recv: bool,
    pub(crate) pending_send: bool,
    pub(crate) pending_accept: bool,
    pub(crate) listener: bool,
    pub(crate) connected: bool,
    pub(crate) connecting: bool,
    pub(crate) write_action: WriteAction,
    /// Remote peer, set by connect/accept; per-datagram for UDP.
    pub(crate) address: Option<SocketAddr>,
    /// Overflow probe byte for UDP truncation detection.
    pub(crate) overflow: u8,
    /// Control-data scratch for recvmsg/sendmsg.
    pub(crate) cmsg: CmsgBuf,
}

impl SockState {
    pub(crate) fn new(fd: RawFd) -> Self {
        SockState {
            fd,
            references: 0,
            recv_result: Ok(()),
            send_result: Ok(()),
            recv_list: VecDeque::new(),
            send_list: VecDeque::new(),
            accept_list: VecDeque::new(),
            connect_ev: None,
            pending_recv: false,
            pending_send: false,
            pending_accept: false,
            listener: false,
            connected: false,
            connecting: false,
            write_action: WriteAction::Send,
            address: None,
            overflow: 0,
            cmsg: CmsgBuf::new(),
        }
    }
}

pub(crate) struct SocketCore {
    pub(crate) manager: Arc<Shared>,
    pub(crate) ty: SocketType,
    pub(crate) state: Mutex<SockState>,
}

enum RecvOutcome {
    /// Terminal: the completion event has been posted.
    Done,
    /// Retry later; the request stays queued.
    Soft(Request),
    /// Zero-length stream read; the caller flushes the whole queue.
    Eof(Request),
}

enum SendOutcome {
    Done,
    Soft(Request),
}

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// EAGAIN/EWOULDBLOCK/EINTR are retryable. So is errno 0: some kernels have
/// reported failure without setting errno, and treating that as hard would
/// tear down a healthy socket.
pub(crate) fn soft_errno(e: i32) -> bool {
    if e == 0 {
        warn!("syscall failed with errno 0, treating as a soft error");
        return true;
    }
    e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::EINTR
}

pub(crate) fn make_nonblock(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Build the completion event from a finished request and queue it on the
/// originating task.
fn post_completion(req: Request, result: Result<(), SockError>) {
    let Request {
        kind,
        task,
        action,
        payload,
        n,
        address,
        pktinfo,
        timestamp,
        attributes,
        ..
    } = req;
    let ev = SocketEvent {
        kind,
        result,
        n,
        payload,
        address,
        pktinfo,
        timestamp,
        attributes,
        new_socket: None,
    };
    task.send(taskio::Event::call(move || action(ev)));
}

fn post_accept_completion(
    task: Task,
    action: Action,
    result: Result<(), SockError>,
    address: Option<SocketAddr>,
    new_socket: Option<Socket>,
) {
    let ev = SocketEvent {
        kind: EventKind::NewConn,
        result,
        n: 0,
        payload: None,
        address,
        pktinfo: None,
        timestamp: None,
        attributes: EventAttrs::empty(),
        new_socket,
    };
    task.send(taskio::Event::call(move || action(ev)));
}

fn post_connect_completion(task: Task, action: Action, result: Result<(), SockError>) {
    let ev = SocketEvent {
        kind: EventKind::Connect,
        result,
        n: 0,
        payload: None,
        address: None,
        pktinfo: None,
        timestamp: None,
        attributes: EventAttrs::empty(),
        new_socket: None,
    };
    task.send(taskio::Event::call(move || action(ev)));
}

impl SocketCore {
    fn poke(&self, fd: RawFd) {
        self.manager.poke_fd(fd);
    }

    /// Last reference gone: queues are empty, hand the descriptor to the
    /// watcher for closing. Called without the socket lock held.
    fn destroy(&self) {
        let fd = self.state.lock().fd;
        trace!(fd, "socket destroyed");
        self.manager.retire(fd);
    }

    /// Dequeue-and-complete for the receive direction. Marks the event fatal
    /// when a terminal error is latched, and releases the queue's socket
    /// reference if the request was attached.
    fn complete_recv(&self, st: &mut SockState, mut req: Request, result: Result<(), SockError>) {
        if st.recv_result.is_err() {
            req.attributes |= EventAttrs::FATALERROR;
        }
        if req.attributes.contains(EventAttrs::ATTACHED) {
            st.references -= 1;
        }
        post_completion(req, result);
    }

    fn complete_send(&self, st: &mut SockState, mut req: Request, result: Result<(), SockError>) {
        if st.send_result.is_err() {
            req.attributes |= EventAttrs::FATALERROR;
        }
        if req.attributes.contains(EventAttrs::ATTACHED) {
            st.references -= 1;
        }
        post_completion(req, result);
    }

    /// One non-blocking receive attempt for `req`.
    fn doio_recv(&self, st: &mut SockState, mut req: Request) -> RecvOutcome {
        if self.ty == SocketType::Tcp {
            req.address = st.address;
        }

        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_RECV_IOV];
        let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };

        let payload = req.payload.as_mut().expect("transfer request without payload");
        let read_count = build_recv(
            self.ty,
            payload,
            req.n,
            &mut msg,
            &mut iov,
            &mut name,
            &mut st.cmsg,
            &mut st.overflow,
        );

        let cc = unsafe { libc::recvmsg(st.fd, &mut msg, 0) };
        if cc < 0 {
            let e = errno();
            if soft_errno(e) {
                return RecvOutcome::Soft(req);
            }

            // Connection errors are terminal only on a connected socket;
            // TCP also latches them so later requests short-circuit.
            if let Some(err) = connection_error(e) {
                if st.connected {
                    if self.ty == SocketType::Tcp {
                        st.recv_result = Err(err);
                    }
                    self.complete_recv(st, req, Err(err));
                    return RecvOutcome::Done;
                }
                return RecvOutcome::Soft(req);
            }

            if e == libc::ENOBUFS {
                self.complete_recv(st, req, Err(SockError::NoResources));
                return RecvOutcome::Done;
            }

            warn!(fd = st.fd, errno = e, "recvmsg failed unexpectedly");
            st.recv_result = Err(SockError::Unexpected);
            self.complete_recv(st, req, Err(SockError::Unexpected));
            return RecvOutcome::Done;
        }

        let mut cc = cc as usize;

        // A zero-length stream read is the peer closing; zero-length
        // datagrams are merely strange.
        if self.ty == SocketType::Tcp && cc == 0 {
            st.recv_result = Err(SockError::Eof);
            return RecvOutcome::Eof(req);
        }

        if self.ty == SocketType::Udp {
            req.address = sockaddr_to_addr(&name, msg.msg_namelen);

            // The overflow probe byte was filled: the datagram was bigger
            // than the regions offered.
            if cc > read_count {
                req.attributes |= EventAttrs::TRUNC;
                cc -= 1;
            }

            let (attrs, pktinfo, timestamp) = process_cmsg(&msg);
            req.attributes |= attrs;
            if pktinfo.is_some() {
                req.pktinfo = pktinfo;
            }
            if timestamp.is_some() {
                req.timestamp = timestamp;
            }
        }

        req.n += cc;
        commit_recv(req.payload.as_mut().expect("payload checked above"), cc);

        if cc != read_count && req.n < req.minimum {
            return RecvOutcome::Soft(req);
        }

        self.complete_recv(st, req, Ok(()));
        RecvOutcome::Done
    }

    /// One non-blocking send attempt for `req`.
    fn doio_send(&self, st: &mut SockState, mut req: Request) -> SendOutcome {
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_SCATTER_GATHER];
        let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };

        let payload = req.payload.as_ref().expect("transfer request without payload");
        let write_count = build_send(
            self.ty,
            payload,
            req.n,
            req.address.as_ref(),
            req.pktinfo.as_ref(),
            &mut msg,
            &mut iov,
            &mut name,
            &mut st.cmsg,
        );

        let cc = unsafe { libc::sendmsg(st.fd, &msg, 0) };
        if cc < 0 {
            let e = errno();
            if soft_errno(e) {
                return SendOutcome::Soft(req);
            }

            if let Some(err) = connection_error(e) {
                if st.connected {
                    if self.ty == SocketType::Tcp {
                        st.send_result = Err(err);
                    }
                    self.complete_send(st, req, Err(err));
                    return SendOutcome::Done;
                }
                return SendOutcome::Soft(req);
            }

            if e == libc::ENOBUFS {
                self.complete_send(st, req, Err(SockError::NoResources));
                return SendOutcome::Done;
            }

            warn!(fd = st.fd, errno = e, "sendmsg failed unexpectedly");
            st.send_result = Err(SockError::Unexpected);
            self.complete_send(st, req, Err(SockError::Unexpected));
            return SendOutcome::Done;
        }

        if cc == 0 {
            warn!(fd = st.fd, "sendmsg returned 0");
        }

        req.n += cc as usize;
        if (cc as usize) != write_count {
            return SendOutcome::Soft(req);
        }

        self.complete_send(st, req, Ok(()));
        SendOutcome::Done
    }

    // === Watcher-side dispatch ===
    //
    // Called with both the manager lock and this socket's lock held. Each
    // dispatch bumps the reference count for the in-flight internal event;
    // the handler releases it. The pending flag blocks re-dispatch until the
    // handler has drained.

    pub(crate) fn dispatch_read(self: &Arc<Self>, st: &mut SockState) {
        let Some(head) = st.recv_list.front() else {
            return;
        };
        if st.pending_recv {
            return;
        }
        st.pending_recv = true;
        st.references += 1;
        trace!(fd = st.fd, "dispatching readable");
        head.task
            .send(taskio::Event::ready(self.clone(), Direction::Read));
    }

    pub(crate) fn dispatch_accept(self: &Arc<Self>, st: &mut SockState) {
        let Some(head) = st.accept_list.front() else {
            return;
        };
        if st.pending_accept {
            return;
        }
        st.pending_accept = true;
        st.references += 1;
        trace!(fd = st.fd, "dispatching accept");
        head.task
            .send(taskio::Event::ready(self.clone(), Direction::Read));
    }

    pub(crate) fn dispatch_write(self: &Arc<Self>, st: &mut SockState) {
        let Some(head) = st.send_list.front() else {
            return;
        };
        if st.pending_send {
            return;
        }
        st.pending_send = true;
        st.write_action = WriteAction::Send;
        st.references += 1;
        trace!(fd = st.fd, "dispatching writable");
        head.task
            .send(taskio::Event::ready(self.clone(), Direction::Write));
    }

    pub(crate) fn dispatch_connect(self: &Arc<Self>, st: &mut SockState) {
        let Some(req) = st.connect_ev.as_ref() else {
            return;
        };
        st.write_action = WriteAction::Connect;
        st.references += 1;
        trace!(fd = st.fd, "dispatching connect");
        req.task
            .send(taskio::Event::ready(self.clone(), Direction::Write));
    }

    // === Internal handlers, run on the task that owns the head request ===

    fn internal_readable(self: Arc<Self>) {
        let mut st = self.state.lock();
        if st.listener {
            debug_assert!(st.pending_accept);
            st.pending_accept = false;
            st.references -= 1;
            if st.references == 0 {
                drop(st);
                self.destroy();
                return;
            }
            self.internal_accept(st);
        } else {
            debug_assert!(st.pending_recv);
            st.pending_recv = false;
            st.references -= 1;
            if st.references == 0 {
                drop(st);
                self.destroy();
                return;
            }
            self.internal_recv(&mut st);
            let dead = st.references == 0;
            drop(st);
            if dead {
                self.destroy();
            }
        }
    }

    fn internal_writable(self: Arc<Self>) {
        let mut st = self.state.lock();
        match st.write_action {
            WriteAction::Connect => {
                st.references -= 1;
                if st.references == 0 {
                    drop(st);
                    self.destroy();
                    return;
                }
                self.internal_connect(st);
            }
            WriteAction::Send => {
                debug_assert!(st.pending_send);
                st.pending_send = false;
                st.references -= 1;
                if st.references == 0 {
                    drop(st);
                    self.destroy();
                    return;
                }
                self.internal_send(&mut st);
                let dead = st.references == 0;
                drop(st);
                if dead {
                    self.destroy();
                }
            }
        }
    }

    /// Drain the receive queue head-first until the kernel runs dry.
    fn internal_recv(&self, st: &mut SockState) {
        loop {
            let Some(req) = st.recv_list.pop_front() else {
                break;
            };

            // Markers complete with whatever is latched, in line.
            if req.kind == EventKind::RecvMark {
                let result = st.recv_result;
                self.complete_recv(st, req, result);
                continue;
            }

            if let Err(e) = st.recv_result {
                self.complete_recv(st, req, Err(e));
                continue;
            }

            match self.doio_recv(st, req) {
                RecvOutcome::Done => continue,
                RecvOutcome::Soft(req) => {
                    st.recv_list.push_front(req);
                    break;
                }
                RecvOutcome::Eof(req) => {
                    // Peer closed: flush the whole queue, markers included.
                    self.complete_recv(st, req, Err(SockError::Eof));
                    while let Some(req) = st.recv_list.pop_front() {
                        self.complete_recv(st, req, Err(SockError::Eof));
                    }
                    break;
                }
            }
        }

        if !st.recv_list.is_empty() {
            self.poke(st.fd);
        }
    }

    fn internal_send(&self, st: &mut SockState) {
        loop {
            let Some(req) = st.send_list.pop_front() else {
                break;
            };

            if req.kind == EventKind::SendMark {
                let result = st.send_result;
                self.complete_send(st, req, result);
                continue;
            }

            if let Err(e) = st.send_result {
                self.complete_send(st, req, Err(e));
                continue;
            }

            match self.doio_send(st, req) {
                SendOutcome::Done => continue,
                SendOutcome::Soft(req) => {
                    st.send_list.push_front(req);
                    break;
                }
            }
        }

        if !st.send_list.is_empty() {
            self.poke(st.fd);
        }
    }

    /// Serve exactly one queued accept.
    fn internal_accept(self: &Arc<Self>, mut st: MutexGuard<'_, SockState>) {
        let Some(req) = st.accept_list.pop_front() else {
            return;
        };

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                st.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };

        if fd < 0 {
            let e = errno();
            if soft_errno(e) {
                st.accept_list.push_front(req);
                self.poke(st.fd);
                return;
            }
            warn!(fd = st.fd, errno = e, "accept failed unexpectedly");
            st.references -= 1;
            if !st.accept_list.is_empty() {
                self.poke(st.fd);
            }
            let dead = st.references == 0;
            drop(st);
            post_accept_completion(req.task, req.action, Err(SockError::Unexpected), None, None);
            if dead {
                self.destroy();
            }
            return;
        }

        st.references -= 1;
        if !st.accept_list.is_empty() {
            self.poke(st.fd);
        }
        let dead = st.references == 0;
        drop(st);

        let AcceptRequest {
            task,
            action,
            nsock,
        } = req;
        let peer = sockaddr_to_addr(&storage, len);

        if let Err(e) = make_nonblock(fd) {
            warn!(fd, error = %e, "could not make accepted socket non-blocking");
            unsafe {
                libc::close(fd);
            }
            post_accept_completion(task, action, Err(SockError::Unexpected), None, None);
            if dead {
                self.destroy();
            }
            return;
        }

        {
            let mut nst = nsock.state.lock();
            nst.fd = fd;
            nst.address = peer;
        }
        self.manager.publish(fd, nsock.clone());
        trace!(fd, ?peer, "accepted connection");

        let socket = Socket { core: nsock };
        post_accept_completion(task, action, Ok(()), peer, Some(socket));
        if dead {
            self.destroy();
        }
    }

    /// A deferred connect became writable: read out SO_ERROR and settle it.
    fn internal_connect(self: &Arc<Self>, mut st: MutexGuard<'_, SockState>) {
        // Cancelled while the internal event was in flight.
        if st.connect_ev.is_none() {
            debug_assert!(!st.connecting);
            return;
        }

        st.connecting = false;

        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                st.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            err = errno();
        }

        let result = if err != 0 {
            if soft_errno(err) || err == libc::EINPROGRESS {
                st.connecting = true;
                self.poke(st.fd);
                return;
            }
            match err {
                libc::ETIMEDOUT => Err(SockError::TimedOut),
                libc::ECONNREFUSED => Err(SockError::ConnRefused),
                libc::ENETUNREACH => Err(SockError::NetUnreach),
                _ => {
                    warn!(fd = st.fd, errno = err, "connect failed unexpectedly");
                    Err(SockError::Unexpected)
                }
            }
        } else {
            Ok(())
        };

        let req = st.connect_ev.take().expect("checked above");
        st.references -= 1;
        let dead = st.references == 0;
        drop(st);

        post_connect_completion(req.task, req.action, result);
        if dead {
            self.destroy();
        }
    }
}

fn connection_error(e: i32) -> Option<SockError> {
    match e {
        libc::ECONNREFUSED => Some(SockError::ConnRefused),
        libc::ENETUNREACH => Some(SockError::NetUnreach),
        libc::EHOSTUNREACH => Some(SockError::HostUnreach),
        _ => None,
    }
}

impl Notify for SocketCore {
    fn ready(self: Arc<Self>, dir: Direction) {
        match dir {
            Direction::Read => self.internal_readable(),
            Direction::Write => self.internal_writable(),
        }
    }
}

/// Handle to a managed socket.
///
/// Cloning attaches another reference; dropping the last handle retires the
/// socket once its queued requests have completed, closing the descriptor on
/// the watcher thread.
pub struct Socket {
    pub(crate) core: Arc<SocketCore>,
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        self.core.state.lock().references += 1;
        Socket {
            core: self.core.clone(),
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let mut st = self.core.state.lock();
        st.references -= 1;
        let dead = st.references == 0;
        drop(st);
        if dead {
            self.core.destroy();
        }
    }
}

impl Socket {
    /// The transport type this socket was created with.
    pub fn socket_type(&self) -> SocketType {
        self.core.ty
    }

    /// The stored remote address: the connect destination or accepted peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.state.lock().address
    }

    /// The locally bound address, queried from the kernel.
    pub fn local_addr(&self) -> Result<SocketAddr, SockError> {
        let st = self.core.state.lock();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                st.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            warn!(fd = st.fd, errno = errno(), "getsockname failed");
            return Err(SockError::Unexpected);
        }
        sockaddr_to_addr(&storage, len).ok_or(SockError::Unexpected)
    }

    /// Bind the socket to a local address. Sets SO_REUSEADDR first.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), SockError> {
        let st = self.core.state.lock();

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                st.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!(fd = st.fd, "setsockopt(SO_REUSEADDR) failed");
            // Press on.
        }

        let (storage, len) = addr_to_sockaddr(&addr);
        let rc = unsafe {
            libc::bind(st.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc < 0 {
            return Err(match errno() {
                libc::EACCES => SockError::NoPerm,
                libc::EADDRNOTAVAIL => SockError::AddrNotAvail,
                libc::EADDRINUSE => SockError::AddrInUse,
                libc::EINVAL => SockError::Bound,
                e => {
                    warn!(fd = st.fd, errno = e, "bind failed unexpectedly");
                    SockError::Unexpected
                }
            });
        }
        Ok(())
    }

    /// Start listening. TCP only; a backlog of 0 selects the system maximum.
    pub fn listen(&self, backlog: u32) -> Result<(), SockError> {
        let mut st = self.core.state.lock();
        assert_eq!(self.core.ty, SocketType::Tcp, "listen on a datagram socket");
        assert!(!st.listener, "socket is already listening");

        let backlog = if backlog == 0 {
            libc::SOMAXCONN
        } else {
            backlog as libc::c_int
        };
        if unsafe { libc::listen(st.fd, backlog) } < 0 {
            warn!(fd = st.fd, errno = errno(), "listen failed");
            return Err(SockError::Unexpected);
        }
        st.listener = true;
        Ok(())
    }

    /// Queue an accept. Each completion carries one new connection; the new
    /// socket is allocated now so cancellation can release it cleanly.
    pub fn accept<F>(&self, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        let core = &self.core;
        let mut st = core.state.lock();
        assert!(st.listener, "accept on a socket that is not listening");

        let nsock = Arc::new(SocketCore {
            manager: core.manager.clone(),
            ty: core.ty,
            state: Mutex::new(SockState::new(-1)),
        });
        nsock.state.lock().references = 1;

        if st.accept_list.is_empty() {
            core.poke(st.fd);
        }
        st.references += 1;
        st.accept_list.push_back(AcceptRequest {
            task: task.clone(),
            action: Box::new(action),
            nsock,
        });
    }

    /// Connect to `addr`. The attempt happens inline; only the kernel's
    /// in-progress answer defers completion to the watcher. At most one
    /// connect may be outstanding.
    pub fn connect<F>(&self, addr: SocketAddr, task: &Task, action: F) -> Result<(), SockError>
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        let core = &self.core;
        let mut st = core.state.lock();
        assert!(!st.connecting, "connect already in progress");

        st.address = Some(addr);
        let (storage, len) = addr_to_sockaddr(&addr);
        let cc = unsafe {
            libc::connect(st.fd, &storage as *const _ as *const libc::sockaddr, len)
        };

        if cc < 0 {
            let e = errno();
            if soft_errno(e) || e == libc::EINPROGRESS {
                st.connecting = true;
                if st.connect_ev.is_none() {
                    core.poke(st.fd);
                }
                st.references += 1;
                st.connect_ev = Some(ConnectRequest {
                    task: task.clone(),
                    action: Box::new(action),
                });
                return Ok(());
            }

            st.connected = false;
            let result = match e {
                libc::ECONNREFUSED => SockError::ConnRefused,
                libc::ENETUNREACH => SockError::NetUnreach,
                _ => {
                    warn!(fd = st.fd, errno = e, "connect failed unexpectedly");
                    return Err(SockError::Unexpected);
                }
            };
            post_connect_completion(task.clone(), Box::new(action), Err(result));
            return Ok(());
        }

        st.connected = true;
        post_connect_completion(task.clone(), Box::new(action), Ok(()));
        Ok(())
    }

    /// Receive into a single region. `minimum` of 0 means the full region
    /// for TCP; UDP always completes on the first datagram.
    pub fn recv<F>(&self, region: Vec<u8>, minimum: usize, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        assert!(minimum <= region.len(), "minimum exceeds region length");
        let mut req = Request::new(EventKind::RecvDone, task.clone(), Box::new(action));
        req.minimum = match self.core.ty {
            SocketType::Udp => 1,
            SocketType::Tcp => {
                if minimum == 0 {
                    region.len()
                } else {
                    minimum
                }
            }
        };
        req.payload = Some(IoPayload::Region(region));
        self.submit_recv(req);
    }

    /// Receive into an ordered buffer list, filling available regions in
    /// order. `minimum` of 0 means the total available space for TCP.
    pub fn recvv<F>(&self, buffers: Vec<IoBuffer>, minimum: usize, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        assert!(!buffers.is_empty(), "empty buffer list");
        assert!(
            buffers.len() <= MAX_SCATTER_GATHER,
            "buffer list exceeds scatter/gather limit"
        );
        let iocount: usize = buffers.iter().map(|b| b.available_len()).sum();
        assert!(iocount > 0, "buffer list has no available space");
        assert!(minimum <= iocount, "minimum exceeds available space");

        let mut req = Request::new(EventKind::RecvDone, task.clone(), Box::new(action));
        req.minimum = match self.core.ty {
            SocketType::Udp => 1,
            SocketType::Tcp => {
                if minimum == 0 {
                    iocount
                } else {
                    minimum
                }
            }
        };
        req.payload = Some(IoPayload::Buffers(buffers));
        self.submit_recv(req);
    }

    /// Send a single region to the connected peer.
    pub fn send<F>(&self, region: Vec<u8>, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        self.sendto(region, None, None, task, action)
    }

    /// Send a single region. On UDP, `address` overrides the connected peer
    /// and `pktinfo` selects the outgoing interface for this datagram.
    pub fn sendto<F>(
        &self,
        region: Vec<u8>,
        address: Option<SocketAddr>,
        pktinfo: Option<Pktinfo>,
        task: &Task,
        action: F,
    ) where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        let mut req = Request::new(EventKind::SendDone, task.clone(), Box::new(action));
        req.payload = Some(IoPayload::Region(region));
        self.prepare_send(&mut req, address, pktinfo);
        self.submit_send(req);
    }

    /// Send an ordered buffer list (each buffer's used region).
    pub fn sendv<F>(&self, buffers: Vec<IoBuffer>, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        self.sendtov(buffers, None, None, task, action)
    }

    /// Buffer-list variant of [`Socket::sendto`].
    pub fn sendtov<F>(
        &self,
        buffers: Vec<IoBuffer>,
        address: Option<SocketAddr>,
        pktinfo: Option<Pktinfo>,
        task: &Task,
        action: F,
    ) where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        assert!(!buffers.is_empty(), "empty buffer list");
        assert!(
            buffers.len() <= MAX_SCATTER_GATHER,
            "buffer list exceeds scatter/gather limit"
        );
        let iocount: usize = buffers.iter().map(|b| b.used_len()).sum();
        assert!(iocount > 0, "buffer list has no data");

        let mut req = Request::new(EventKind::SendDone, task.clone(), Box::new(action));
        req.payload = Some(IoPayload::Buffers(buffers));
        self.prepare_send(&mut req, address, pktinfo);
        self.submit_send(req);
    }

    /// Queue a receive-direction marker: a no-op request that completes with
    /// the direction's latched result once everything ahead of it has.
    pub fn recv_mark<F>(&self, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        let core = &self.core;
        let mut st = core.state.lock();
        let mut req = Request::new(EventKind::RecvMark, task.clone(), Box::new(action));

        if st.recv_list.is_empty() {
            let result = st.recv_result;
            core.complete_recv(&mut st, req, result);
            return;
        }

        req.attributes |= EventAttrs::ATTACHED;
        st.references += 1;
        st.recv_list.push_back(req);
    }

    /// Send-direction marker; see [`Socket::recv_mark`].
    pub fn send_mark<F>(&self, task: &Task, action: F)
    where
        F: FnOnce(SocketEvent) + Send + 'static,
    {
        let core = &self.core;
        let mut st = core.state.lock();
        let mut req = Request::new(EventKind::SendMark, task.clone(), Box::new(action));

        if st.send_list.is_empty() {
            let result = st.send_result;
            core.complete_send(&mut st, req, result);
            return;
        }

        req.attributes |= EventAttrs::ATTACHED;
        st.references += 1;
        st.send_list.push_back(req);
    }

    /// Cancel queued requests. For each direction selected in `how`, every
    /// request submitted by `task` (or every request, when `task` is `None`)
    /// completes with `Canceled`. Cancellation outranks latched errors; an
    /// internal event already in flight completes its request normally.
    pub fn cancel(&self, task: Option<&Task>, how: CancelFlags) {
        if how.is_empty() {
            return;
        }

        let core = &self.core;
        let mut st = core.state.lock();

        if how.contains(CancelFlags::RECV) && !st.recv_list.is_empty() {
            let list = mem::take(&mut st.recv_list);
            for req in list {
                if task.is_none_or(|t| *t == req.task) {
                    core.complete_recv(&mut st, req, Err(SockError::Canceled));
                } else {
                    st.recv_list.push_back(req);
                }
            }
        }

        if how.contains(CancelFlags::SEND) && !st.send_list.is_empty() {
            let list = mem::take(&mut st.send_list);
            for req in list {
                if task.is_none_or(|t| *t == req.task) {
                    core.complete_send(&mut st, req, Err(SockError::Canceled));
                } else {
                    st.send_list.push_back(req);
                }
            }
        }

        if how.contains(CancelFlags::ACCEPT) && !st.accept_list.is_empty() {
            let list = mem::take(&mut st.accept_list);
            for req in list {
                if task.is_none_or(|t| *t == req.task) {
                    st.references -= 1;
                    // The pre-allocated socket goes with the request.
                    post_accept_completion(
                        req.task,
                        req.action,
                        Err(SockError::Canceled),
                        None,
                        None,
                    );
                } else {
                    st.accept_list.push_back(req);
                }
            }
        }

        if how.contains(CancelFlags::CONNECT)
            && let Some(pending) = st.connect_ev.as_ref()
            && task.is_none_or(|t| *t == pending.task)
        {
            debug_assert!(st.connecting);
            st.connecting = false;
            let req = st.connect_ev.take().expect("checked above");
            st.references -= 1;
            post_connect_completion(req.task, req.action, Err(SockError::Canceled));
        }

        core.poke(st.fd);
    }

    fn prepare_send(&self, req: &mut Request, address: Option<SocketAddr>, pktinfo: Option<Pktinfo>) {
        match self.core.ty {
            SocketType::Udp => {
                req.address = address;
                if let Some(info) = pktinfo {
                    req.attributes |= EventAttrs::PKTINFO;
                    req.pktinfo = Some(info);
                }
            }
            SocketType::Tcp => {
                assert!(
                    address.is_none() && pktinfo.is_none(),
                    "per-datagram metadata on a stream socket"
                );
            }
        }
    }

    fn submit_recv(&self, mut req: Request) {
        let core = &self.core;
        let mut st = core.state.lock();

        let was_empty = st.recv_list.is_empty();
        if was_empty {
            if let Err(e) = st.recv_result {
                core.complete_recv(&mut st, req, Err(e));
                return;
            }
            match core.doio_recv(&mut st, req) {
                RecvOutcome::Done => return,
                RecvOutcome::Eof(req) => {
                    core.complete_recv(&mut st, req, Err(SockError::Eof));
                    return;
                }
                RecvOutcome::Soft(soft) => req = soft,
            }
        }

        req.attributes |= EventAttrs::ATTACHED;
        st.references += 1;
        st.recv_list.push_back(req);
        if was_empty {
            core.poke(st.fd);
        }
    }

    fn submit_send(&self, mut req: Request) {
        let core = &self.core;
        let mut st = core.state.lock();

        // Default the destination to the connected peer.
        if self.core.ty == SocketType::Udp && req.address.is_none() {
            req.address = st.address;
            assert!(
                req.address.is_some(),
                "datagram send without a destination on an unconnected socket"
            );
        } else if self.core.ty == SocketType::Tcp {
            req.address = st.address;
        }

        let was_empty = st.send_list.is_empty();
        if was_empty {
            if let Err(e) = st.send_result {
                core.complete_send(&mut st, req, Err(e));
                return;
            }
            match core.doio_send(&mut st, req) {
                SendOutcome::Done => return,
                SendOutcome::Soft(soft) => req = soft,
            }
        }

        req.attributes |= EventAttrs::ATTACHED;
        st.references += 1;
        st.send_list.push_back(req);
        if was_empty {
            core.poke(st.fd);
        }
    }
}
