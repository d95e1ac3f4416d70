//! Relay transport bridging tests over a loopback rendezvous.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use vigil_core::control::RelayAddress;
use vigil_core::net::{RelayListener, RelayStream, connect};

use super::Relay;

struct Harness {
    address: RelayAddress,
    from_link_tx: mpsc::Sender<Vec<u8>>,
    to_link_rx: mpsc::Receiver<Vec<u8>>,
}

async fn start_relay() -> Harness {
    let (listener, address) = RelayListener::bind_loopback().await.unwrap();
    let (from_link_tx, from_link_rx) = mpsc::channel(128);
    let (to_link_tx, to_link_rx) = mpsc::channel(128);
    tokio::spawn(Relay::new(listener, from_link_rx, to_link_tx).run());
    Harness {
        address,
        from_link_tx,
        to_link_rx,
    }
}

async fn dial(harness: &Harness) -> RelayStream {
    let stream = connect(&harness.address).await.unwrap();
    // Let the relay task process the accept before bytes flow.
    sleep(Duration::from_millis(50)).await;
    stream
}

#[tokio::test]
async fn bridges_both_directions() {
    let mut harness = start_relay().await;
    let mut worker = dial(&harness).await;

    harness
        .from_link_tx
        .send(b":irc PRIVMSG #ops :hi\r\n".to_vec())
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), worker.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b":irc PRIVMSG #ops :hi\r\n");

    worker.write_all(b"PONG :1\r\n").await.unwrap();
    let chunk = timeout(Duration::from_secs(2), harness.to_link_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk, b"PONG :1\r\n");
}

#[tokio::test]
async fn new_connection_replaces_stale_one() {
    let mut harness = start_relay().await;
    let mut stale = dial(&harness).await;
    let mut fresh = dial(&harness).await;

    harness
        .from_link_tx
        .send(b"to-current\r\n".to_vec())
        .await
        .unwrap();

    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(2), fresh.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"to-current\r\n");

    // The stale connection gets nothing.
    assert!(
        timeout(Duration::from_millis(200), stale.read(&mut buf))
            .await
            .is_err()
    );

    // Bytes from the current worker still reach the link.
    fresh.write_all(b"from-current\r\n").await.unwrap();
    let chunk = timeout(Duration::from_secs(2), harness.to_link_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk, b"from-current\r\n");
}

#[tokio::test]
async fn worker_eof_does_not_close_the_write_leg() {
    let mut harness = start_relay().await;
    let worker = dial(&harness).await;
    let (mut read_half, mut write_half) = tokio::io::split(worker);

    // Worker half-closes: the relay's read leg sees EOF.
    write_half.shutdown().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // The write leg keeps flowing.
    harness
        .from_link_tx
        .send(b"still-flowing\r\n".to_vec())
        .await
        .unwrap();
    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(2), read_half.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"still-flowing\r\n");
}

#[tokio::test]
async fn drops_chunks_while_no_worker_connected() {
    let mut harness = start_relay().await;

    // Nobody connected: these must be drained, not buffered.
    for _ in 0..10 {
        harness
            .from_link_tx
            .send(b"dropped\r\n".to_vec())
            .await
            .unwrap();
    }
    // Give the relay time to drain before a worker shows up.
    sleep(Duration::from_millis(50)).await;

    let mut worker = dial(&harness).await;
    harness
        .from_link_tx
        .send(b"delivered\r\n".to_vec())
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    let n = timeout(Duration::from_secs(2), worker.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"delivered\r\n");
}
