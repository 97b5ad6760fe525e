//! Scatter/gather message construction and ancillary-data handling.
//!
//! Builds the `msghdr`/iovec pair for one `sendmsg` or `recvmsg` call from a
//! request's payload and resume point, and cracks the control messages the
//! kernel returns (IPv6 packet-info, receive timestamp).

use std::mem;
use std::net::{Ipv6Addr, SocketAddr};
use std::ptr;

use crate::addr::addr_to_sockaddr;
use crate::event::{EventAttrs, IoPayload, Pktinfo, Timestamp};
use crate::socket::SocketType;

/// Maximum iovecs in one transfer. Buffer lists longer than this are a usage
/// error, enforced at submission.
pub(crate) const MAX_SCATTER_GATHER: usize = 8;

/// Receive path steals one extra slot for the overflow probe byte.
pub(crate) const MAX_RECV_IOV: usize = MAX_SCATTER_GATHER + 1;

/// Control-data scratch size. Covers IPv6 packet-info plus a kernel
/// timestamp with headroom for cmsg alignment padding.
pub(crate) const CMSG_SCRATCH: usize = 128;

/// Aligned scratch region for control data. `cmsghdr` access requires
/// native word alignment, which a bare byte array does not guarantee.
#[repr(C, align(8))]
pub(crate) struct CmsgBuf(pub(crate) [u8; CMSG_SCRATCH]);

impl CmsgBuf {
    pub(crate) fn new() -> Self {
        CmsgBuf([0u8; CMSG_SCRATCH])
    }
}

/// Fill `iov` with the bytes still to send: everything in `payload` past the
/// resume point `n`. Returns (iovec count, byte count).
pub(crate) fn send_vectors(
    payload: &IoPayload,
    n: usize,
    iov: &mut [libc::iovec],
) -> (usize, usize) {
    match payload {
        IoPayload::Region(region) => {
            let write_count = region.len() - n;
            iov[0] = libc::iovec {
                iov_base: region[n..].as_ptr() as *mut libc::c_void,
                iov_len: write_count,
            };
            (1, write_count)
        }
        IoPayload::Buffers(bufs) => {
            // Skip whole buffers already consumed by earlier attempts, then
            // resume partway through the buffer that straddles `n`.
            let mut skip = n;
            let mut count = 0;
            let mut write_count = 0;
            for buf in bufs {
                if skip >= buf.used_len() {
                    skip -= buf.used_len();
                    continue;
                }
                let used = &buf.used()[skip..];
                skip = 0;
                if used.is_empty() {
                    continue;
                }
                assert!(count < iov.len(), "send buffer list exceeds iovec limit");
                iov[count] = libc::iovec {
                    iov_base: used.as_ptr() as *mut libc::c_void,
                    iov_len: used.len(),
                };
                write_count += used.len();
                count += 1;
            }
            assert!(skip == 0, "resume point past end of buffer list");
            (count, write_count)
        }
    }
}

/// Fill `iov` with the regions a receive may write into. Returns
/// (iovec count, byte count). `max` bounds the data iovecs so the caller can
/// reserve a slot for the overflow probe.
pub(crate) fn recv_vectors(
    payload: &mut IoPayload,
    n: usize,
    iov: &mut [libc::iovec],
    max: usize,
) -> (usize, usize) {
    match payload {
        IoPayload::Region(region) => {
            let read_count = region.len() - n;
            iov[0] = libc::iovec {
                iov_base: region[n..].as_mut_ptr() as *mut libc::c_void,
                iov_len: read_count,
            };
            (1, read_count)
        }
        IoPayload::Buffers(bufs) => {
            let mut count = 0;
            let mut read_count = 0;
            for buf in bufs {
                if buf.available_len() == 0 {
                    continue;
                }
                assert!(count < max, "receive buffer list exceeds iovec limit");
                let avail = buf.available_mut();
                iov[count] = libc::iovec {
                    iov_base: avail.as_mut_ptr() as *mut libc::c_void,
                    iov_len: avail.len(),
                };
                read_count += avail.len();
                count += 1;
            }
            (count, read_count)
        }
    }
}

/// Build the `msghdr` for one send attempt. Returns the byte count this
/// attempt can transmit.
///
/// The destination address is attached only for UDP; TCP uses the connected
/// peer. Packet-info, when requested on a UDP socket, rides along as one
/// IPv6 control message in the socket's scratch region.
pub(crate) fn build_send(
    ty: SocketType,
    payload: &IoPayload,
    n: usize,
    dest: Option<&SocketAddr>,
    pktinfo: Option<&Pktinfo>,
    msg: &mut libc::msghdr,
    iov: &mut [libc::iovec; MAX_SCATTER_GATHER],
    name: &mut libc::sockaddr_storage,
    cmsg: &mut CmsgBuf,
) -> usize {
    *msg = unsafe { mem::zeroed() };

    if ty == SocketType::Udp {
        let dest = dest.expect("UDP send without destination");
        let (storage, len) = addr_to_sockaddr(dest);
        *name = storage;
        msg.msg_name = name as *mut _ as *mut libc::c_void;
        msg.msg_namelen = len;
    }

    let (count, write_count) = send_vectors(payload, n, iov.as_mut_slice());
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = count as _;

    if ty == SocketType::Udp
        && let Some(info) = pktinfo
    {
        let space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) } as usize;
        msg.msg_control = cmsg.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;
        unsafe {
            let hdr = libc::CMSG_FIRSTHDR(msg);
            (*hdr).cmsg_level = libc::IPPROTO_IPV6;
            (*hdr).cmsg_type = libc::IPV6_PKTINFO;
            (*hdr).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
            let data = libc::CMSG_DATA(hdr) as *mut libc::in6_pktinfo;
            ptr::write_unaligned(
                data,
                libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: info.addr.octets(),
                    },
                    ipi6_ifindex: info.ifindex,
                },
            );
        }
    }

    write_count
}

/// Build the `msghdr` for one receive attempt. Returns the byte count this
/// attempt can deliver, excluding the overflow probe.
///
/// On UDP the name buffer captures the datagram source, one iovec slot is
/// stolen for the overflow probe byte, and the full control scratch is
/// offered so the kernel may deliver timestamp and packet-info. TCP receives
/// carry none of that.
pub(crate) fn build_recv(
    ty: SocketType,
    payload: &mut IoPayload,
    n: usize,
    msg: &mut libc::msghdr,
    iov: &mut [libc::iovec; MAX_RECV_IOV],
    name: &mut libc::sockaddr_storage,
    cmsg: &mut CmsgBuf,
    overflow: &mut u8,
) -> usize {
    *msg = unsafe { mem::zeroed() };

    let max = if ty == SocketType::Udp {
        MAX_RECV_IOV - 1
    } else {
        MAX_RECV_IOV
    };
    let (mut count, read_count) = recv_vectors(payload, n, iov.as_mut_slice(), max);

    if ty == SocketType::Udp {
        *name = unsafe { mem::zeroed() };
        msg.msg_name = name as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // One spare byte past the payload: if the kernel fills it the
        // datagram overflowed the regions, even where MSG_TRUNC is absent.
        iov[count] = libc::iovec {
            iov_base: overflow as *mut u8 as *mut libc::c_void,
            iov_len: 1,
        };
        count += 1;

        msg.msg_control = cmsg.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = CMSG_SCRATCH as _;
    }

    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = count as _;

    read_count
}

/// Crack the control messages and flags of a received `msghdr`.
pub(crate) fn process_cmsg(
    msg: &libc::msghdr,
) -> (EventAttrs, Option<Pktinfo>, Option<Timestamp>) {
    let mut attrs = EventAttrs::empty();
    let mut pktinfo = None;
    let mut timestamp = None;

    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        attrs |= EventAttrs::TRUNC;
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        attrs |= EventAttrs::CTRUNC;
    }

    if msg.msg_controllen == 0 || msg.msg_control.is_null() {
        return (attrs, pktinfo, timestamp);
    }

    unsafe {
        let mut cmsgp = libc::CMSG_FIRSTHDR(msg);
        while !cmsgp.is_null() {
            let level = (*cmsgp).cmsg_level;
            let kind = (*cmsgp).cmsg_type;

            if level == libc::IPPROTO_IPV6 && kind == libc::IPV6_PKTINFO {
                let info =
                    ptr::read_unaligned(libc::CMSG_DATA(cmsgp) as *const libc::in6_pktinfo);
                pktinfo = Some(Pktinfo {
                    addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
                    ifindex: info.ipi6_ifindex,
                });
                attrs |= EventAttrs::PKTINFO;
            } else if level == libc::SOL_SOCKET && kind == libc::SCM_TIMESTAMP {
                let tv = ptr::read_unaligned(libc::CMSG_DATA(cmsgp) as *const libc::timeval);
                timestamp = Some(Timestamp {
                    seconds: tv.tv_sec as i64,
                    nanoseconds: (tv.tv_usec * 1000) as u32,
                });
                attrs |= EventAttrs::TIMESTAMP;
            }

            cmsgp = libc::CMSG_NXTHDR(msg, cmsgp);
        }
    }

    (attrs, pktinfo, timestamp)
}

/// Record `count` received bytes against a buffer-list payload, marking each
/// buffer's fill in order. Single-region payloads track progress through the
/// request's `n` alone.
pub(crate) fn commit_recv(payload: &mut IoPayload, count: usize) {
    let IoPayload::Buffers(bufs) = payload else {
        return;
    };
    let mut remaining = count;
    for buf in bufs {
        if remaining == 0 {
            break;
        }
        let step = remaining.min(buf.available_len());
        buf.add(step);
        remaining -= step;
    }
    assert!(remaining == 0, "received more than the buffer list holds");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoBuffer;

    fn region(len: usize) -> IoPayload {
        IoPayload::Region(vec![0u8; len])
    }

    #[test]
    fn test_send_vectors_region_resume() {
        let payload = IoPayload::Region(b"abcdefgh".to_vec());
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_SCATTER_GATHER];

        let (count, write_count) = send_vectors(&payload, 3, &mut iov);
        assert_eq!(count, 1);
        assert_eq!(write_count, 5);
        assert_eq!(iov[0].iov_len, 5);
    }

    #[test]
    fn test_send_vectors_skip_consumed_buffers() {
        let mut a = IoBuffer::new(8);
        a.append(b"aaaa");
        let mut b = IoBuffer::new(8);
        b.append(b"bbbbbb");
        let empty = IoBuffer::new(8);
        let mut c = IoBuffer::new(8);
        c.append(b"cc");
        let payload = IoPayload::Buffers(vec![a, b, empty, c]);
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_SCATTER_GATHER];

        // n = 5: all of the first buffer plus one byte of the second.
        let (count, write_count) = send_vectors(&payload, 5, &mut iov);
        assert_eq!(count, 2);
        assert_eq!(write_count, 5 + 2);
        assert_eq!(iov[0].iov_len, 5);
        assert_eq!(iov[1].iov_len, 2);
    }

    #[test]
    fn test_recv_vectors_skip_full_buffers() {
        let mut a = IoBuffer::new(4);
        a.add(4);
        let b = IoBuffer::new(6);
        let mut payload = IoPayload::Buffers(vec![a, b]);
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_RECV_IOV];

        let (count, read_count) = recv_vectors(&mut payload, 0, &mut iov, MAX_RECV_IOV);
        assert_eq!(count, 1);
        assert_eq!(read_count, 6);
    }

    #[test]
    fn test_build_recv_udp_steals_overflow_slot() {
        let mut payload = region(16);
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_RECV_IOV];
        let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut cmsg = CmsgBuf::new();
        let mut overflow = 0u8;

        let read_count = build_recv(
            SocketType::Udp,
            &mut payload,
            0,
            &mut msg,
            &mut iov,
            &mut name,
            &mut cmsg,
            &mut overflow,
        );
        assert_eq!(read_count, 16);
        assert_eq!(msg.msg_iovlen as usize, 2);
        assert_eq!(iov[1].iov_len, 1);
        assert!(!msg.msg_name.is_null());
        assert!(!msg.msg_control.is_null());
    }

    #[test]
    fn test_build_recv_tcp_is_bare() {
        let mut payload = region(16);
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_RECV_IOV];
        let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut cmsg = CmsgBuf::new();
        let mut overflow = 0u8;

        let read_count = build_recv(
            SocketType::Tcp,
            &mut payload,
            6,
            &mut msg,
            &mut iov,
            &mut name,
            &mut cmsg,
            &mut overflow,
        );
        assert_eq!(read_count, 10);
        assert_eq!(msg.msg_iovlen as usize, 1);
        assert!(msg.msg_name.is_null());
        assert!(msg.msg_control.is_null());
    }

    #[test]
    fn test_pktinfo_roundtrips_through_control_data() {
        let payload = IoPayload::Region(b"x".to_vec());
        let dest: SocketAddr = "[::1]:5300".parse().unwrap();
        let info = Pktinfo {
            addr: "fe80::1".parse().unwrap(),
            ifindex: 7,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_SCATTER_GATHER];
        let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut cmsg = CmsgBuf::new();

        build_send(
            SocketType::Udp,
            &payload,
            0,
            Some(&dest),
            Some(&info),
            &mut msg,
            &mut iov,
            &mut name,
            &mut cmsg,
        );

        let (attrs, cracked, ts) = process_cmsg(&msg);
        assert!(attrs.contains(EventAttrs::PKTINFO));
        assert_eq!(cracked, Some(info));
        assert_eq!(ts, None);
    }

    #[test]
    fn test_commit_recv_distributes_across_buffers() {
        let a = IoBuffer::new(4);
        let b = IoBuffer::new(8);
        let mut payload = IoPayload::Buffers(vec![a, b]);

        commit_recv(&mut payload, 6);
        let IoPayload::Buffers(bufs) = &payload else {
            unreachable!()
        };
        assert_eq!(bufs[0].used_len(), 4);
        assert_eq!(bufs[1].used_len(), 2);
    }
}
