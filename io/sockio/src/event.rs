//! Completion events and their metadata.

use std::net::{Ipv6Addr, SocketAddr};

use bitflags::bitflags;

use crate::buffer::IoBuffer;
use crate::error::SockError;
use crate::socket::Socket;

/// What operation a completion event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A receive request finished.
    RecvDone,
    /// A send request finished.
    SendDone,
    /// An accept produced a new connection.
    NewConn,
    /// A connect attempt finished.
    Connect,
    /// A receive-queue marker reached the head of the queue.
    RecvMark,
    /// A send-queue marker reached the head of the queue.
    SendMark,
}

bitflags! {
    /// Attributes carried on a completion event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventAttrs: u32 {
        /// The request was queued and held task and socket references.
        const ATTACHED = 0x1;
        /// IPv6 packet-info metadata is present.
        const PKTINFO = 0x2;
        /// A kernel receive timestamp is present.
        const TIMESTAMP = 0x4;
        /// The datagram was larger than the receive region.
        const TRUNC = 0x8;
        /// Control data was truncated by the kernel.
        const CTRUNC = 0x10;
        /// The direction carried a latched terminal error when this event
        /// was delivered.
        const FATALERROR = 0x20;
    }
}

bitflags! {
    /// Selects which directions `Socket::cancel` sweeps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CancelFlags: u32 {
        const RECV = 0x1;
        const SEND = 0x2;
        const ACCEPT = 0x4;
        const CONNECT = 0x8;
        const ALL = 0xf;
    }
}

/// IPv6 packet information: the source interface and address a datagram
/// should leave through, or arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pktinfo {
    pub addr: Ipv6Addr,
    pub ifindex: u32,
}

/// Kernel receive timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

/// The byte storage a transfer request operates on: one contiguous region or
/// an ordered list of buffers.
#[derive(Debug)]
pub enum IoPayload {
    /// A single region. Sends transmit the whole slice; receives fill it.
    Region(Vec<u8>),
    /// An ordered buffer list. Sends transmit each used region; receives
    /// append into each available region.
    Buffers(Vec<IoBuffer>),
}

impl IoPayload {
    /// Total bytes a send of this payload would transmit.
    pub fn send_len(&self) -> usize {
        match self {
            IoPayload::Region(region) => region.len(),
            IoPayload::Buffers(bufs) => bufs.iter().map(|b| b.used_len()).sum(),
        }
    }

    /// Total bytes a receive into this payload could hold.
    pub fn recv_len(&self) -> usize {
        match self {
            IoPayload::Region(region) => region.len(),
            IoPayload::Buffers(bufs) => bufs.iter().map(|b| b.available_len()).sum(),
        }
    }
}

/// A completion event, delivered to the originating task.
pub struct SocketEvent {
    /// The operation that completed.
    pub kind: EventKind,
    /// Outcome. Markers report the direction's latched result.
    pub result: Result<(), SockError>,
    /// Bytes transferred across all attempts of this request.
    pub n: usize,
    /// The request's byte storage, handed back to the caller. `None` for
    /// markers, accepts and connects.
    pub payload: Option<IoPayload>,
    /// Peer address: the datagram source for UDP receives, the destination
    /// for UDP sends, the remote end otherwise.
    pub address: Option<SocketAddr>,
    /// IPv6 packet info, when `attributes` contains `PKTINFO`.
    pub pktinfo: Option<Pktinfo>,
    /// Kernel receive timestamp, when `attributes` contains `TIMESTAMP`.
    pub timestamp: Option<Timestamp>,
    /// Event attributes.
    pub attributes: EventAttrs,
    /// The accepted socket on a `NewConn` completion.
    pub new_socket: Option<Socket>,
}

impl SocketEvent {
    /// The region or buffer list, consumed. Convenience for callers that know
    /// the payload shape they submitted.
    pub fn take_region(&mut self) -> Option<Vec<u8>> {
        match self.payload.take() {
            Some(IoPayload::Region(region)) => Some(region),
            other => {
                self.payload = other;
                None
            }
        }
    }

    /// The buffer list, consumed.
    pub fn take_buffers(&mut self) -> Option<Vec<IoBuffer>> {
        match self.payload.take() {
            Some(IoPayload::Buffers(bufs)) => Some(bufs),
            other => {
                self.payload = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_bits_are_distinct() {
        let all = EventAttrs::all();
        assert!(all.contains(EventAttrs::ATTACHED));
        assert!(all.contains(EventAttrs::FATALERROR));
        assert_eq!(all.bits(), 0x3f);
    }

    #[test]
    fn test_cancel_all_covers_every_direction() {
        assert_eq!(
            CancelFlags::ALL,
            CancelFlags::RECV | CancelFlags::SEND | CancelFlags::ACCEPT | CancelFlags::CONNECT
        );
    }

    #[test]
    fn test_payload_lengths() {
        let region = IoPayload::Region(vec![0u8; 40]);
        assert_eq!(region.send_len(), 40);
        assert_eq!(region.recv_len(), 40);

        let mut a = IoBuffer::new(16);
        a.append(b"abc");
        let b = IoBuffer::new(8);
        let list = IoPayload::Buffers(vec![a, b]);
        assert_eq!(list.send_len(), 3);
        assert_eq!(list.recv_len(), 13 + 8);
    }
}
