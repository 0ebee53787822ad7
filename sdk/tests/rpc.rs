//! End-to-end scenarios over real transports, in one process.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use codec::{
    FlatBuffer,
    endpoint::EndPoint,
    flat,
    header::{CallHeader, MESSAGE_HEADER_SIZE, MessageHeader, MessageId, MessageType},
};
use flatwire::{
    Config, Rpc,
    config::Http,
    nameserver::{Nameserver, nameserver_object_id},
};
use service::{
    Error,
    poa::{Lifespan, Poa, PoaBuilder, activation},
    stream::chunk_data,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use flatwire_sdk::{
    bytestream::{ByteStream, ByteStreamServant},
    echo::{self, Echo, EchoServant, Mirror},
    factory::{Factory, FactoryServant},
    tracker::{self, Tracker, TrackerImpl, TrackerServant},
};

async fn tcp_server() -> Result<(Rpc, Arc<Poa>, EndPoint)> {
    let config = Config {
        listen_tcp_port: Some(0),
        ..Config::default()
    };

    let server = Rpc::new(config);
    server.serve().await?;

    let poa = server.create_poa(PoaBuilder::new().max_objects(64))?;
    let endpoint = server.tcp_endpoint().expect("tcp listener bound");

    Ok((server, poa, endpoint))
}

#[tokio::test]
async fn tcp_echo_roundtrip() -> Result<()> {
    let (server, poa, endpoint) = tcp_server().await?;

    let oid = poa.activate(Arc::new(EchoServant(Mirror)), activation::ALLOW_ALL)?;
    let id = poa.object_id(oid, echo::CLASS_ID, echo::INTERFACE_IDX, "localhost", endpoint.clone());

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;
    let proxy = Echo::new(session.object(id));

    let input: Vec<u8> = (0u8..=255).collect();
    assert_eq!(proxy.echo(&input).await?, input);

    // Requests on one session stay FIFO even when pipelined.
    let first = proxy.echo(b"first");
    let second = proxy.echo(b"second");
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first?, b"first");
    assert_eq!(second?, b"second");

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn user_exception_surfaces_at_the_proxy() -> Result<()> {
    let (server, poa, endpoint) = tcp_server().await?;

    let oid = poa.activate(Arc::new(EchoServant(Mirror)), activation::ALLOW_ALL)?;
    let id = poa.object_id(oid, echo::CLASS_ID, echo::INTERFACE_IDX, "localhost", endpoint.clone());

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;
    let proxy = Echo::new(session.object(id));

    match proxy.fail_with(7, "boom").await {
        Err(Error::UserException(exception)) => {
            assert_eq!(exception.class_id, "flatwire.demo/mirror-error");
            assert_eq!(&exception.payload[..4], &7u32.to_le_bytes());
            assert_eq!(&exception.payload[4..], b"boom");
        }
        other => panic!("expected user exception, got {other:?}"),
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn unknown_object_and_masked_transport() -> Result<()> {
    let (server, poa, endpoint) = tcp_server().await?;

    // Activated, but admitted on shared memory only.
    let oid = poa.activate(
        Arc::new(EchoServant(Mirror)),
        activation::ALLOW_SHARED_MEMORY,
    )?;
    let masked =
        poa.object_id(oid, echo::CLASS_ID, echo::INTERFACE_IDX, "localhost", endpoint.clone());

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;

    let proxy = Echo::new(session.object(masked.clone()));
    assert!(matches!(proxy.echo(b"x").await, Err(Error::UnknownObject)));

    // A never-activated id answers the same way.
    let mut ghost = masked;
    ghost.object_id = (77u64 << 32) | 5;
    let proxy = Echo::new(session.object(ghost));
    assert!(matches!(proxy.echo(b"x").await, Err(Error::UnknownObject)));

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn call_timeout_frees_the_caller() -> Result<()> {
    // A listener that accepts and then goes quiet.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let endpoint = EndPoint::tcp([127, 0, 0, 1].into(), addr.port());
    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;

    let id = nameserver_object_id(endpoint);
    let object = session.object(id);
    object.set_timeout(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let result = object.invoke(0, 0, |_| Ok(())).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(5));

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn connect_to_nobody_is_comm_failure() {
    let client = Rpc::new(Config::default());

    // Port 1 is privileged and essentially never bound in test
    // environments.
    let endpoint = EndPoint::tcp([127, 0, 0, 1].into(), 1);
    assert!(matches!(
        client.connect(&endpoint).await,
        Err(Error::CommFailure)
    ));
}

#[tokio::test]
async fn shm_count_ones_large_payload() -> Result<()> {
    let name = format!("fw-it-shm-{}", std::process::id());
    let config = Config {
        listen_shm: Some(name),
        shared_memory_size: 4 * 1024 * 1024,
        ..Config::default()
    };

    let server = Rpc::new(config);
    server.serve().await?;

    let poa = server.create_poa(PoaBuilder::new().max_objects(8))?;
    let oid = poa.activate(Arc::new(EchoServant(Mirror)), activation::ALLOW_ALL)?;
    let endpoint = server.shm_endpoint().expect("shm listener bound");
    let id = poa.object_id(oid, echo::CLASS_ID, echo::INTERFACE_IDX, "localhost", endpoint.clone());

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;
    let proxy = Echo::new(session.object(id));

    let payload = vec![0xFFu8; 1024 * 1024];
    assert_eq!(
        proxy.count_ones(&payload).await? as usize,
        payload.len() * 8
    );

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn byte_stream_delivers_and_completes() -> Result<()> {
    let (server, poa, endpoint) = tcp_server().await?;

    let oid = poa.activate(Arc::new(ByteStreamServant), activation::ALLOW_ALL)?;
    let id = poa.object_id(
        oid,
        flatwire_sdk::bytestream::CLASS_ID,
        flatwire_sdk::bytestream::INTERFACE_IDX,
        "localhost",
        endpoint.clone(),
    );

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;
    let proxy = ByteStream::new(session.object(id));

    let stream_id = proxy.get_byte_stream(1000).await?;
    let mut reader = session.stream_reader(stream_id)?;

    let mut count = 0u32;
    while let Some(chunk) = reader.next().await {
        let frame = chunk?;
        assert_eq!(chunk_data(&frame)?, &[count as u8]);
        count += 1;
    }

    assert_eq!(count, 1000);

    client.shutdown();
    server.shutdown();
    Ok(())
}

struct Counting(Arc<AtomicUsize>);

impl TrackerImpl for Counting {
    fn position_update(&self, x: f32, y: f32, z: f32) {
        assert_eq!((x, y, z), (1.0, 2.0, 3.0));
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn udp_fire_and_forget_and_reliable() -> Result<()> {
    let config = Config {
        listen_udp_port: Some(0),
        ..Config::default()
    };

    let server = Rpc::new(config);
    server.serve().await?;

    let received = Arc::new(AtomicUsize::new(0));
    let poa = server.create_poa(PoaBuilder::new().max_objects(8))?;
    let tracker_oid = poa.activate(
        Arc::new(TrackerServant(Counting(received.clone()))),
        activation::ALLOW_UDP,
    )?;
    let echo_oid = poa.activate(Arc::new(EchoServant(Mirror)), activation::ALLOW_UDP)?;

    let endpoint = server.udp_endpoint().expect("udp socket bound");
    let tracker_id = poa.object_id(
        tracker_oid,
        tracker::CLASS_ID,
        tracker::INTERFACE_IDX,
        "localhost",
        endpoint.clone(),
    );
    let echo_id = poa.object_id(
        echo_oid,
        echo::CLASS_ID,
        echo::INTERFACE_IDX,
        "localhost",
        endpoint.clone(),
    );

    let client = Rpc::new(Config::default());
    let session = client.connect(&endpoint).await?;

    // Best effort: the client never blocks, the server sees most of it.
    let sent = 1000;
    let proxy = Tracker::new(session.object(tracker_id));
    for _ in 0..sent {
        proxy.position_update(1.0, 2.0, 3.0)?;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let delivered = received.load(Ordering::Relaxed);
    assert!(delivered > 0 && delivered <= sent);

    // Reliable mode shares the socket and correlates by request id.
    let echo = Echo::new(session.object(echo_id));
    assert_eq!(echo.count_ones(&[0x0F, 0xF0]).await?, 8);

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn udp_reliable_times_out_without_a_peer() -> Result<()> {
    // Grab a port, then free it: nothing will answer there.
    let port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        socket.local_addr()?.port()
    };

    let client = Rpc::new(Config::default());
    let endpoint = EndPoint::udp([127, 0, 0, 1].into(), port);
    let session = client.connect(&endpoint).await?;

    let object = session.object(nameserver_object_id(endpoint));
    object.set_timeout(Duration::from_millis(400));

    assert!(matches!(
        object.invoke(0, 1, |buf| {
            let base = flat::reserve_struct(buf, 8)?;
            flat::alloc_str(buf, base, "anyone")?;
            Ok(())
        })
        .await,
        Err(Error::Timeout)
    ));

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn udp_reliable_retransmits_through_loss() -> Result<()> {
    // A peer that swallows the first two datagrams, then answers; only
    // retransmission gets the call through.
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let port = peer.local_addr()?.port();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut dropped = 0;

        loop {
            let Ok((size, from)) = peer.recv_from(&mut buf).await else {
                return;
            };

            if dropped < 2 {
                dropped += 1;
                continue;
            }

            let request = FlatBuffer::from_bytes(&buf[..size]);
            let Ok(header) = MessageHeader::decode(&request, 0) else {
                continue;
            };

            let mut reply = FlatBuffer::new();
            let base =
                MessageHeader::new(MessageId::Success, MessageType::Answer, header.request_id)
                    .encode(&mut reply)
                    .unwrap();
            MessageHeader::patch_size(&mut reply, base).unwrap();

            let _ = peer.send_to(reply.data(), from).await;
            return;
        }
    });

    let client = Rpc::new(Config::default());
    let endpoint = EndPoint::udp([127, 0, 0, 1].into(), port);
    let session = client.connect(&endpoint).await?;

    let object = session.object(nameserver_object_id(endpoint));
    object.set_timeout(Duration::from_millis(800));

    // Two drops, then the answer cancels the retry timer.
    object.invoke(0, 0, |_| Ok(())).await?;

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn transient_servants_die_with_their_session() -> Result<()> {
    let (server, persistent_poa, endpoint) = tcp_server().await?;

    let transient_poa = server.create_poa(
        PoaBuilder::new()
            .max_objects(16)
            .lifespan(Lifespan::Transient),
    )?;

    let factory_oid = persistent_poa.activate(
        Arc::new(FactoryServant {
            poa: transient_poa.clone(),
            endpoint: endpoint.clone(),
            hostname: "localhost".to_string(),
            template: Mirror,
        }),
        activation::ALLOW_ALL,
    )?;
    let factory_id = persistent_poa.object_id(
        factory_oid,
        flatwire_sdk::factory::CLASS_ID,
        flatwire_sdk::factory::INTERFACE_IDX,
        "localhost",
        endpoint.clone(),
    );

    let client = Rpc::new(Config::default());

    // Session X: mint a transient echo and use it.
    let session_x = client.connect(&endpoint).await?;
    let factory = Factory::new(session_x.object(factory_id.clone()));
    let transient_id = factory.create_echo().await?;

    let transient = Echo::new(session_x.object(transient_id.clone()));
    assert_eq!(transient.echo(b"alive").await?, b"alive");
    assert_eq!(transient_poa.object_count(), 1);

    // Closing X releases everything activated for it.
    session_x.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transient_poa.object_count(), 0);

    // A fresh session: the transient reference is dead, the persistent
    // factory is not.
    let session_y = client.connect(&endpoint).await?;
    let stale = Echo::new(session_y.object(transient_id));
    assert!(matches!(stale.echo(b"x").await, Err(Error::UnknownObject)));

    let factory = Factory::new(session_y.object(factory_id));
    assert!(factory.create_echo().await.is_ok());

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn nameserver_binds_and_resolves() -> Result<()> {
    let config = Config {
        listen_tcp_port: Some(0),
        ..Config::default()
    };

    let server = flatwire::server_main(config).await?;
    let endpoint = server.tcp_endpoint().expect("tcp listener bound");

    let client = Rpc::new(Config::default());
    let ns = Nameserver::connect(&client, &endpoint).await?;

    let id = nameserver_object_id(endpoint.clone());
    ns.bind(&id, "self").await?;

    assert_eq!(ns.resolve("self").await?, Some(id));
    assert_eq!(ns.resolve("ghost").await?, None);

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Build a complete call frame the way a proxy would.
fn raw_call_frame(call: CallHeader, request_id: u32, marshal: impl FnOnce(&mut FlatBuffer)) -> Vec<u8> {
    let mut buf = FlatBuffer::new();
    let base = MessageHeader::new(MessageId::FunctionCall, MessageType::Request, request_id)
        .encode(&mut buf)
        .unwrap();
    call.encode(&mut buf).unwrap();
    marshal(&mut buf);
    MessageHeader::patch_size(&mut buf, base).unwrap();

    buf.data().to_vec()
}

#[tokio::test]
async fn http_unary_roundtrip() -> Result<()> {
    let config = Config {
        http: Some(Http {
            port: 0,
            ..Http::default()
        }),
        ..Config::default()
    };

    let server = Rpc::new(config);
    server.serve().await?;

    let poa = server.create_poa(PoaBuilder::new().max_objects(8))?;
    let oid = poa.activate(Arc::new(EchoServant(Mirror)), activation::ALLOW_HTTP)?;
    let addr = server.http_addr().expect("http listener bound");

    let frame = raw_call_frame(
        CallHeader {
            object_id: oid,
            poa_idx: poa.index(),
            interface_idx: echo::INTERFACE_IDX,
            function_idx: echo::fns::ECHO,
        },
        1,
        |buf| {
            let base = flat::reserve_struct(buf, 8).unwrap();
            flat::alloc_bytes(buf, base, b"over http").unwrap();
        },
    );

    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    let request = format!(
        "POST /rpc HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        frame.len()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(&frame).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let split = response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("header terminator");
    let head = std::str::from_utf8(&response[..split])?;
    assert!(head.starts_with("HTTP/1.1 200"));

    let body = FlatBuffer::from_bytes(&response[split + 4..]);
    let header = MessageHeader::decode(&body, 0)?;
    assert_eq!(header.msg_id, MessageId::BlockResponse);
    assert_eq!(header.request_id, 1);
    assert_eq!(flat::get_bytes(&body, MESSAGE_HEADER_SIZE)?, b"over http");

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn dropping_a_raw_session_releases_its_objects() -> Result<()> {
    let (server, persistent_poa, endpoint) = tcp_server().await?;

    let transient_poa = server.create_poa(
        PoaBuilder::new()
            .max_objects(4)
            .lifespan(Lifespan::Transient),
    )?;

    let factory_oid = persistent_poa.activate(
        Arc::new(FactoryServant {
            poa: transient_poa.clone(),
            endpoint: endpoint.clone(),
            hostname: "localhost".to_string(),
            template: Mirror,
        }),
        activation::ALLOW_ALL,
    )?;

    // Speak the wire by hand and then vanish without ceremony.
    let addr = server.tcp_addr().unwrap();
    {
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        let frame = raw_call_frame(
            CallHeader {
                object_id: factory_oid,
                poa_idx: persistent_poa.index(),
                interface_idx: flatwire_sdk::factory::INTERFACE_IDX,
                function_idx: flatwire_sdk::factory::fns::CREATE_ECHO,
            },
            1,
            |_| {},
        );
        stream.write_all(&frame).await?;

        // Wait for the reply so the activation definitely happened.
        let mut size = [0u8; 4];
        stream.read_exact(&mut size).await?;
        let mut body = vec![0u8; u32::from_le_bytes(size) as usize];
        stream.read_exact(&mut body).await?;

        assert_eq!(transient_poa.object_count(), 1);
    }

    // The dropped socket reads as EOF; teardown releases the servant.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transient_poa.object_count(), 0);

    server.shutdown();
    Ok(())
}
