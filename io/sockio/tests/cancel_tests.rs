//! Cancellation and lifecycle tests: per-direction sweeps, per-task
//! matching, accept/connect cancellation, and clean manager shutdown.

use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use sockio::{
    CancelFlags, EventKind, Family, SockError, Socket, SocketEvent, SocketManager, SocketType,
};
use taskio::{Config, Dispatcher};

const WAIT: Duration = Duration::from_secs(5);

fn engine() -> (Dispatcher, SocketManager) {
    let dispatcher = Dispatcher::new(Config {
        workers: 2,
        quantum: 32,
    });
    let manager = SocketManager::new().unwrap();
    (dispatcher, manager)
}

fn capture(tx: Sender<SocketEvent>) -> impl FnOnce(SocketEvent) + Send + 'static {
    move |ev| {
        let _ = tx.send(ev);
    }
}

fn tcp_pair(dispatcher: &Dispatcher, manager: &SocketManager) -> (Socket, Socket) {
    let task = dispatcher.task();
    let listener = manager.socket(Family::V4, SocketType::Tcp).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(1).unwrap();
    let laddr = listener.local_addr().unwrap();

    let (atx, arx) = unbounded();
    listener.accept(&task, capture(atx));

    let client = manager.socket(Family::V4, SocketType::Tcp).unwrap();
    let (ctx, crx) = unbounded();
    client.connect(laddr, &task, capture(ctx)).unwrap();
    assert_eq!(crx.recv_timeout(WAIT).unwrap().result, Ok(()));

    let mut aev = arx.recv_timeout(WAIT).unwrap();
    assert_eq!(aev.result, Ok(()));
    (client, aev.new_socket.take().unwrap())
}

#[test]
fn test_cancel_recv_then_recover() {
    let (dispatcher, manager) = engine();
    {
        let task = dispatcher.task();
        let (client, server) = tcp_pair(&dispatcher, &manager);

        let (rtx, rrx) = unbounded();
        server.recv(vec![0u8; 10], 10, &task, capture(rtx));

        server.cancel(None, CancelFlags::RECV);
        let rev = rrx.recv_timeout(WAIT).unwrap();
        assert_eq!(rev.result, Err(SockError::Canceled));

        // Cancellation is not sticky; the direction keeps working.
        let (rtx, rrx) = unbounded();
        server.recv(vec![0u8; 10], 10, &task, capture(rtx));
        let (stx, srx) = unbounded();
        client.send(b"0123456789".to_vec(), &task, capture(stx));
        assert_eq!(srx.recv_timeout(WAIT).unwrap().result, Ok(()));

        let rev = rrx.recv_timeout(WAIT).unwrap();
        assert_eq!(rev.result, Ok(()));
        assert_eq!(rev.n, 10);
    }
    manager.shutdown();
    dispatcher.shutdown();
}

#[test]
fn test_cancel_all_directions_delivers_every_completion() {
    let (dispatcher, manager) = engine();
    {
        let task = dispatcher.task();
        let (client, server) = tcp_pair(&dispatcher, &manager);

        let (tx, rx) = unbounded();
        for _ in 0..3 {
            server.recv(vec![0u8; 8], 8, &task, capture(tx.clone()));
        }

        server.cancel(None, CancelFlags::ALL);
        for _ in 0..3 {
            let ev = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(ev.kind, EventKind::RecvDone);
            assert_eq!(ev.result, Err(SockError::Canceled));
        }
        // Exactly three: the queues are empty now.
        assert!(rx.try_recv().is_err());

        drop(client);
    }
    manager.shutdown();
    dispatcher.shutdown();
}

#[test]
fn test_cancel_matches_requesting_task() {
    let (dispatcher, manager) = engine();
    {
        let task_a = dispatcher.task();
        let task_b = dispatcher.task();
        let (client, server) = tcp_pair(&dispatcher, &manager);

        let (atx, arx) = unbounded();
        let (btx, brx) = unbounded();
        server.recv(vec![0u8; 8], 8, &task_a, capture(atx));
        server.recv(vec![0u8; 8], 8, &task_b, capture(btx));

        server.cancel(Some(&task_a), CancelFlags::RECV);
        assert_eq!(
            arx.recv_timeout(WAIT).unwrap().result,
            Err(SockError::Canceled)
        );
        // Task B's request is still queued.
        assert!(brx.try_recv().is_err());

        server.cancel(Some(&task_b), CancelFlags::RECV);
        assert_eq!(
            brx.recv_timeout(WAIT).unwrap().result,
            Err(SockError::Canceled)
        );

        drop(client);
    }
    manager.shutdown();
    dispatcher.shutdown();
}

#[test]
fn test_cancel_accept_releases_preallocated_socket() {
    let (dispatcher, manager) = engine();
    {
        let task = dispatcher.task();
        let listener = manager.socket(Family::V4, SocketType::Tcp).unwrap();
        listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(1).unwrap();

        let (atx, arx) = unbounded();
        listener.accept(&task, capture(atx));

        listener.cancel(None, CancelFlags::ACCEPT);
        let aev = arx.recv_timeout(WAIT).unwrap();
        assert_eq!(aev.kind, EventKind::NewConn);
        assert_eq!(aev.result, Err(SockError::Canceled));
        assert!(aev.new_socket.is_none());
    }
    // Shutdown hangs if the pre-allocated socket leaked a reference.
    manager.shutdown();
    dispatcher.shutdown();
}

#[test]
fn test_cancel_pending_connect_then_reconnect() {
    let (dispatcher, manager) = engine();
    {
        let task = dispatcher.task();

        // TEST-NET-1 is unrouted: the connect stays in progress.
        let client = manager.socket(Family::V4, SocketType::Tcp).unwrap();
        let (ctx, crx) = unbounded();
        client
            .connect("192.0.2.1:9".parse().unwrap(), &task, capture(ctx))
            .unwrap();

        client.cancel(None, CancelFlags::CONNECT);
        let cev = crx.recv_timeout(WAIT).unwrap();
        assert_eq!(cev.kind, EventKind::Connect);
        assert!(matches!(
            cev.result,
            Err(SockError::Canceled) | Err(SockError::NetUnreach) | Err(SockError::HostUnreach)
        ));

        // The socket is out of the connecting state; a fresh connect on a
        // new socket against a live listener succeeds.
        let (fresh_client, _server) = tcp_pair(&dispatcher, &manager);
        drop(fresh_client);
        drop(client);
    }
    manager.shutdown();
    dispatcher.shutdown();
}

#[test]
fn test_shutdown_after_socket_churn() {
    let (dispatcher, manager) = engine();
    {
        let task = dispatcher.task();
        for _ in 0..8 {
            let s = manager.socket(Family::V4, SocketType::Udp).unwrap();
            s.bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let (tx, rx) = unbounded();
            s.recv(vec![0u8; 32], 1, &task, capture(tx));
            s.cancel(None, CancelFlags::RECV);
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap().result,
                Err(SockError::Canceled)
            );
        }

        let cloned = {
            let s = manager.socket(Family::V4, SocketType::Udp).unwrap();
            s.clone()
        };
        // The clone keeps the socket alive past the original handle.
        assert_eq!(cloned.socket_type(), SocketType::Udp);
        drop(cloned);
    }
    // Returns only once every descriptor is closed and the watcher joined.
    manager.shutdown();
    dispatcher.shutdown();
}
