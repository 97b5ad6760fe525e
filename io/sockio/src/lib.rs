//! sockio - a readiness-driven UDP/TCP socket engine.
//!
//! A [`SocketManager`] multiplexes many sockets over one watcher thread
//! blocked in the kernel's readiness primitive. Clients submit non-blocking
//! operations (connect, accept, send, receive, markers) bound to a
//! [`taskio::Task`]; the engine performs scatter/gather transfers, attaches
//! per-datagram metadata (source address, IPv6 packet-info, kernel
//! timestamp), and delivers results as [`SocketEvent`]s on the originating
//! task. Per socket and direction, completions arrive in submission order.
//!
//! # Quick start
//!
//! ```ignore
//! use sockio::{Family, SocketManager, SocketType};
//! use taskio::{Config, Dispatcher};
//!
//! let dispatcher = Dispatcher::new(Config::default());
//! let task = dispatcher.task();
//! let manager = SocketManager::new()?;
//!
//! let sock = manager.socket(Family::V4, SocketType::Udp)?;
//! sock.bind("127.0.0.1:0".parse()?)?;
//! sock.recv(vec![0u8; 512], 1, &task, |ev| {
//!     println!("{} bytes from {:?}", ev.n, ev.address);
//! });
//! ```
//!
//! # Lifecycle
//!
//! Sockets are reference-counted handles: [`Socket::clone`] attaches,
//! dropping detaches, and queued requests keep the socket alive until they
//! complete. The last release hands the descriptor to the watcher for
//! closing. [`SocketManager::shutdown`] blocks until every socket is gone,
//! then stops the watcher.

mod addr;
mod buffer;
mod error;
mod event;
mod manager;
mod msghdr;
mod socket;

pub use buffer::IoBuffer;
pub use error::SockError;
pub use event::{
    CancelFlags, EventAttrs, EventKind, IoPayload, Pktinfo, SocketEvent, Timestamp,
};
pub use manager::SocketManager;
pub use socket::{Family, Socket, SocketType};
