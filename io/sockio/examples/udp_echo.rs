//! UDP echo server.
//!
//! Binds a datagram socket and echoes every payload back to its sender,
//! re-arming one receive at a time.
//!
//! ```sh
//! cargo run --example udp_echo -- 127.0.0.1:5300
//! # then: ncat -u 127.0.0.1 5300
//! ```

use std::net::SocketAddr;

use crossbeam_channel::unbounded;
use sockio::{Family, SocketManager, SocketType};
use taskio::{Config, Dispatcher};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5300".to_string())
        .parse()
        .expect("listen address");

    let dispatcher = Dispatcher::new(Config::default());
    let task = dispatcher.task();
    let manager = SocketManager::new().expect("socket manager");

    let sock = manager
        .socket(Family::V4, SocketType::Udp)
        .expect("udp socket");
    sock.bind(addr).expect("bind");
    println!("echoing on {}", sock.local_addr().expect("local addr"));

    let (tx, rx) = unbounded();
    loop {
        let tx = tx.clone();
        sock.recv(vec![0u8; 2048], 1, &task, move |ev| {
            let _ = tx.send(ev);
        });

        let mut ev = rx.recv().expect("completion");
        if let Err(e) = ev.result {
            eprintln!("receive failed: {e}");
            break;
        }
        let peer = ev.address;
        let n = ev.n;
        let mut data = ev.take_region().expect("region");
        data.truncate(n);
        println!("{} bytes from {:?}", n, peer);

        sock.sendto(data, peer, None, &task, |ev| {
            if let Err(e) = ev.result {
                eprintln!("echo failed: {e}");
            }
        });
    }

    drop(sock);
    manager.shutdown();
    dispatcher.shutdown();
}
