use std::{sync::Arc, time::Duration};

use anyhow::Result;
use flatwire_shm::{Handshake, ShmChannel, ShmListener, Side};

fn unique(tag: &str) -> String {
    format!("{}-{}", tag, std::process::id())
}

#[test]
fn channel_pair_roundtrip() -> Result<()> {
    let id = unique("fw-test-pair");
    let server = ShmChannel::create(&id, Side::Server, 64 * 1024)?;
    let client = ShmChannel::open(&id, Side::Client)?;

    client.send(b"ping")?;
    let mut buf = [0u8; 32];
    let size = server.read_with_timeout(&mut buf, Duration::from_secs(1))?;
    assert_eq!(&buf[..size], b"ping");

    // And the other direction, zero-copy on both ends.
    let mut reservation = server.reserve_write(4)?;
    reservation.payload_mut().copy_from_slice(b"pong");
    reservation.commit(4);

    let view = client.try_read_view().expect("reply visible");
    assert_eq!(view.as_slice(), b"pong");
    view.commit();

    Ok(())
}

#[test]
fn listener_rendezvous() -> Result<()> {
    let name = unique("fw-test-accept");
    let listener = Arc::new(ShmListener::bind(&name)?);

    let (tx, rx) = std::sync::mpsc::channel();
    let _accept = listener.start(64 * 1024, move |channel| {
        let _ = tx.send(channel);
    });

    let client = ShmListener::connect(&name)?;
    let server = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(server.id(), client.id());

    client.send(b"hello")?;
    let mut buf = [0u8; 32];
    let size = server.read_with_timeout(&mut buf, Duration::from_secs(1))?;
    assert_eq!(&buf[..size], b"hello");

    listener.stop();
    Ok(())
}

#[test]
fn handshake_rejects_garbage() {
    assert!(Handshake::decode(&[0u8; 8]).is_err());

    let mut record = Handshake {
        channel_id: "x".repeat(80),
    }
    .encode();

    // The id field truncates at 64 bytes.
    let decoded = Handshake::decode(&record).unwrap();
    assert_eq!(decoded.channel_id.len(), 64);

    record[0] ^= 0xFF;
    assert!(Handshake::decode(&record).is_err());
}
