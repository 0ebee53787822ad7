//! UDP transport.
//!
//! Datagram framing: one frame per datagram, nothing around it. Two call
//! modes share the socket: fire-and-forget (`request_id == 0`, no ack, no
//! retransmit) and reliable (per-call retransmit timer, first matching
//! answer cancels it). The server dispatches on the receive task and only
//! echoes a reply when the request id is nonzero.
//!
//! Client sockets are cached per peer address for the life of the
//! process; a cache entry is reused while its socket is still open.

use crate::rpc::Dispatcher;

use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    flat,
    header::{MESSAGE_HEADER_SIZE, MessageHeader, MessageType},
};
use parking_lot::Mutex;
use service::{
    Error, ReferenceList, SessionHandle,
    session::Work,
    stream::StreamManager,
};
use tokio::{net::UdpSocket, sync::Notify, sync::oneshot};

/// Datagram payload ceiling; keeps frames under the usual path MTU.
pub const MAX_DATAGRAM: usize = 1200;

/// Retransmissions before a reliable call times out.
pub const MAX_RETRIES: u32 = 3;

type PendingMap = Mutex<HashMap<u32, oneshot::Sender<Result<FlatBuffer, Error>>>>;

pub struct UdpSession {
    socket: Arc<UdpSocket>,
    pending: Arc<PendingMap>,
    next_request_id: AtomicU32,
    remote: EndPoint,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

impl UdpSession {
    async fn dial(endpoint: EndPoint) -> Result<Arc<Self>, Error> {
        let addr = endpoint.socket_addr().ok_or(Error::CommFailure)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|err| {
            log::warn!("udp bind failed: err={}", err);
            Error::CommFailure
        })?;
        socket.connect(addr).await.map_err(|err| {
            log::warn!("udp connect failed: addr={}, err={}", addr, err);
            Error::CommFailure
        })?;

        let session = Arc::new(Self {
            socket: Arc::new(socket),
            pending: Arc::new(Mutex::new(HashMap::with_capacity(32))),
            next_request_id: AtomicU32::new(0),
            remote: endpoint,
            open: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(Notify::new()),
        });

        session.spawn_receiver();
        Ok(session)
    }

    /// Answers come back on the same socket; match them against the
    /// pending calls. The first match wins, which cancels the call's
    /// retransmit task implicitly.
    fn spawn_receiver(self: &Arc<Self>) {
        let socket = self.socket.clone();
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        let open = self.open.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM + 64];

            loop {
                let size = tokio::select! {
                    received = socket.recv(&mut buf) => match received {
                        Ok(size) => size,
                        Err(err) => {
                            log::warn!("udp receive failed: err={}", err);
                            continue;
                        }
                    },
                    _ = closed.notified() => break,
                };

                let frame = FlatBuffer::from_bytes(&buf[..size]);
                let header = match MessageHeader::decode(&frame, 0) {
                    Ok(header) => header,
                    Err(_) => continue,
                };

                // The datagram boundary must agree with the header.
                if header.size as usize != size - 4 {
                    log::warn!("udp frame size mismatch dropped: size={}", size);
                    continue;
                }

                if header.msg_type != MessageType::Answer || header.request_id == 0 {
                    continue;
                }

                if let Some(reply) = pending.lock().remove(&header.request_id) {
                    let _ = reply.send(Ok(frame));
                }
            }

            open.store(false, Ordering::Relaxed);
        });
    }

    fn alloc_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
            if id != 0 {
                return id;
            }
        }
    }
}

impl SessionHandle for UdpSession {
    fn submit(&self, work: Work) -> Result<(), Error> {
        if !self.is_open() {
            work.fail(Error::CommFailure);
            return Err(Error::CommFailure);
        }

        if work.buffer().map(|buf| buf.len() > MAX_DATAGRAM).unwrap_or(false) {
            work.fail(Error::MessageTooLarge);
            return Err(Error::MessageTooLarge);
        }

        match work {
            Work::Request {
                mut buf,
                reply,
                timeout,
            } => {
                let request_id = self.alloc_request_id();
                flat::put(&mut buf, 8, request_id)?;

                self.pending.lock().insert(request_id, reply);

                // The retransmit task owns sending entirely: first
                // attempt, retries, and the final timeout.
                let socket = self.socket.clone();
                let pending = self.pending.clone();
                let datagram = buf.data().to_vec();
                let slice = timeout / (MAX_RETRIES + 1);

                tokio::spawn(async move {
                    for attempt in 0..=MAX_RETRIES {
                        if !pending.lock().contains_key(&request_id) {
                            return;
                        }

                        if let Err(err) = socket.send(&datagram).await {
                            log::warn!(
                                "udp send failed: request_id={}, attempt={}, err={}",
                                request_id,
                                attempt,
                                err
                            );
                        }

                        tokio::time::sleep(slice).await;
                    }

                    if let Some(reply) = pending.lock().remove(&request_id) {
                        let _ = reply.send(Err(Error::Timeout));
                    }
                });

                Ok(())
            }
            Work::Oneway { buf } => {
                // Never block the caller; a dropped datagram is within
                // contract.
                match self.socket.try_send(buf.data()) {
                    Ok(_) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                    Err(err) => {
                        log::warn!("udp oneway send failed: err={}", err);
                        Err(Error::CommFailure)
                    }
                }
            }
            Work::Stream { .. } => Err(Error::Protocol),
            Work::Close => {
                self.close();
                Ok(())
            }
        }
    }

    fn remote_endpoint(&self) -> &EndPoint {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.closed.notify_waiters();

        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err(Error::OperationAborted));
        }
    }
}

fn cache() -> &'static Mutex<HashMap<String, Arc<UdpSession>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<UdpSession>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::with_capacity(16)))
}

/// Client session for a UDP peer, shared process-wide per address.
pub async fn connect(
    endpoint: EndPoint,
) -> Result<(Arc<dyn SessionHandle>, Arc<StreamManager>), Error> {
    let addr = endpoint.socket_addr().ok_or(Error::CommFailure)?;
    let key = addr.to_string();

    if let Some(session) = cache().lock().get(&key)
        && session.is_open()
    {
        return Ok((session.clone(), StreamManager::new()));
    }

    let session = UdpSession::dial(endpoint).await?;
    cache().lock().insert(key, session.clone());

    Ok((session, StreamManager::new()))
}

/// Start the UDP ingress: one worker per core sharing the socket, since
/// the kernel serialises datagram reads anyway and extra workers only
/// help to keep dispatch off the receive path.
pub async fn serve(dispatcher: Arc<Dispatcher>, socket: UdpSocket, max_message: usize) {
    let socket = Arc::new(socket);
    let workers = num_cpus::get();

    for _ in 0..workers {
        tokio::spawn(fork_socket(
            dispatcher.clone(),
            socket.clone(),
            max_message,
        ));
    }

    log::info!(
        "udp server listening: interface={:?}, workers={}",
        socket.local_addr().ok(),
        workers
    );
}

/// One worker: dispatch each datagram on the spot, echo a reply only for
/// reliable calls.
async fn fork_socket(dispatcher: Arc<Dispatcher>, socket: Arc<UdpSocket>, max_message: usize) {
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (size, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                log::warn!("udp socket receive error: err={}", err);
                continue;
            }
        };

        log::trace!("udp socket receive: size={}, addr={:?}", size, peer);

        if size < MESSAGE_HEADER_SIZE || size > max_message {
            continue;
        }

        let frame = FlatBuffer::from_bytes(&buf[..size]);
        let valid = matches!(
            MessageHeader::decode(&frame, 0),
            Ok(header) if header.size as usize == size - 4
        );
        if !valid {
            log::warn!("udp bad frame dropped: addr={:?}", peer);
            continue;
        }

        let remote = match peer {
            SocketAddr::V4(v4) => EndPoint::udp(*v4.ip(), v4.port()),
            SocketAddr::V6(_) => continue,
        };

        // Datagrams have no session; references handed out here live
        // only as long as the dispatch.
        let refs = ReferenceList::new();
        let reply = dispatcher.dispatch_frame(
            frame,
            &remote,
            &refs,
            None,
            None,
            TransportKind::Udp,
            false,
        );
        dispatcher.release_session(&refs);

        if let Some(reply) = reply
            && let Err(err) = socket.send_to(reply.data(), peer).await
        {
            log::warn!("udp reply send failed: addr={:?}, err={}", peer, err);
        }
    }
}
