//! TCP transport.
//!
//! The wire frame is the message itself: the header's leading `size`
//! field doubles as the length prefix, so a frame occupies `size + 4`
//! bytes on the stream. One async task per connection runs the session
//! driver; the transport below it keeps a byte accumulator so a dropped
//! in-flight `recv` never loses a partial frame.

use crate::{
    rpc::Dispatcher,
    session::{FrameTransport, SessionParams, drive},
};

use std::{io, net::SocketAddr, os::fd::AsRawFd, sync::Arc};

use bytes::{Buf, BytesMut};
use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    header::MESSAGE_HEADER_SIZE,
};
use service::{
    ReferenceList, SessionHandle,
    session::{SessionReceiver, session_queue},
    stream::StreamManager,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Socket buffer sizing for bulk transfers.
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Configure a socket by fd: no Nagle delay, large kernel buffers. Shared
/// with the epoll ingress path, which never sees a tokio stream.
pub(crate) fn tune_fd(fd: std::os::fd::RawFd) {
    let one: libc::c_int = 1;
    let size = SOCKET_BUFFER_SIZE as libc::c_int;

    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn tune_socket(stream: &TcpStream) {
    tune_fd(stream.as_raw_fd());
}

/// Pull one complete frame out of the accumulator, if present.
pub(crate) fn extract_frame(rx: &mut BytesMut, max_message: usize) -> io::Result<Option<FlatBuffer>> {
    if rx.len() < 4 {
        return Ok(None);
    }

    let size = u32::from_le_bytes(rx[..4].try_into().unwrap()) as usize;
    let total = size + 4;

    if total < MESSAGE_HEADER_SIZE || total > max_message {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size out of bounds: {size}"),
        ));
    }

    if rx.len() < total {
        return Ok(None);
    }

    let frame = FlatBuffer::from_bytes(&rx[..total]);
    rx.advance(total);

    Ok(Some(frame))
}

pub struct TcpTransport {
    stream: Option<TcpStream>,
    rx: BytesMut,
    /// Dial address for client sessions; servers never reconnect.
    dial: Option<SocketAddr>,
    /// One reconnect attempt per failure event.
    reconnect_spent: bool,
    max_message: usize,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr, max_message: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        tune_socket(&stream);

        Ok(Self {
            stream: Some(stream),
            rx: BytesMut::with_capacity(16 * 1024),
            dial: Some(addr),
            reconnect_spent: false,
            max_message,
        })
    }

    pub fn accepted(stream: TcpStream, max_message: usize) -> Self {
        tune_socket(&stream);

        Self {
            stream: Some(stream),
            rx: BytesMut::with_capacity(16 * 1024),
            dial: None,
            reconnect_spent: false,
            max_message,
        }
    }

    fn is_client(&self) -> bool {
        self.dial.is_some()
    }

    async fn redial(&mut self) -> io::Result<()> {
        let addr = self.dial.expect("redial is client-only");
        let stream = TcpStream::connect(addr).await?;
        tune_socket(&stream);

        // A half-parsed frame from the old connection is garbage now.
        self.rx.clear();
        self.stream = Some(stream);
        log::info!("tcp session reconnected: addr={}", addr);

        Ok(())
    }
}

impl FrameTransport for TcpTransport {
    async fn recv(&mut self) -> io::Result<Option<FlatBuffer>> {
        loop {
            if let Some(frame) = extract_frame(&mut self.rx, self.max_message)? {
                return Ok(Some(frame));
            }

            match &mut self.stream {
                Some(stream) => match stream.read_buf(&mut self.rx).await {
                    Ok(0) => {
                        if self.is_client() {
                            // Stay alive; the next request gets one
                            // reconnect attempt.
                            self.stream = None;
                        } else {
                            return Ok(None);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if self.is_client() {
                            log::warn!("tcp read failed, session idle: err={}", err);
                            self.stream = None;
                        } else {
                            return Err(err);
                        }
                    }
                },
                None => {
                    // Disconnected client: nothing to read until a send
                    // re-establishes the connection.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            let is_client = self.is_client();
            match &mut self.stream {
                Some(stream) => match stream.write_all(frame).await {
                    Ok(()) => {
                        self.reconnect_spent = false;
                        return Ok(());
                    }
                    Err(err)
                        if self.is_client()
                            && !self.reconnect_spent
                            && matches!(
                                err.kind(),
                                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                            ) =>
                    {
                        log::warn!("tcp write failed, reconnecting once: err={}", err);
                        self.reconnect_spent = true;
                        self.stream = None;
                    }
                    Err(err) => return Err(err),
                },
                None if is_client => {
                    // The single reconnect attempt for this failure
                    // event; a redial error ends the session.
                    self.reconnect_spent = true;
                    self.redial().await?;
                }
                None => return Err(io::ErrorKind::NotConnected.into()),
            }
        }
    }
}

/// Dial a peer and spin up the client session.
pub async fn connect(
    dispatcher: Arc<Dispatcher>,
    endpoint: EndPoint,
    max_message: usize,
) -> io::Result<(Arc<dyn SessionHandle>, Arc<StreamManager>)> {
    let addr = endpoint
        .socket_addr()
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

    let transport = TcpTransport::connect(addr, max_message).await?;
    let (sender, receiver) = session_queue(endpoint.clone());
    let streams = StreamManager::new();
    let handle: Arc<dyn SessionHandle> = sender;

    spawn_session(
        transport,
        receiver,
        handle.clone(),
        dispatcher,
        streams.clone(),
        SessionParams {
            remote: endpoint,
            kind: TransportKind::Tcp,
            ssl: false,
        },
    );

    Ok((handle, streams))
}

/// Accept loop for the async TCP ingress path.
pub async fn listen(dispatcher: Arc<Dispatcher>, listener: TcpListener, max_message: usize) {
    let local_addr = listener.local_addr().ok();

    while let Ok((stream, addr)) = listener.accept().await {
        log::info!(
            "tcp socket accept: addr={:?}, interface={:?}",
            addr,
            local_addr
        );

        let remote = match addr {
            SocketAddr::V4(v4) => EndPoint::tcp(*v4.ip(), v4.port()),
            SocketAddr::V6(_) => {
                log::warn!("ipv6 peer rejected: addr={}", addr);
                continue;
            }
        };

        let transport = TcpTransport::accepted(stream, max_message);
        let (sender, receiver) = session_queue(remote.clone());
        let handle: Arc<dyn SessionHandle> = sender;

        spawn_session(
            transport,
            receiver,
            handle,
            dispatcher.clone(),
            StreamManager::new(),
            SessionParams {
                remote,
                kind: TransportKind::Tcp,
                ssl: false,
            },
        );
    }

    log::error!("tcp server close: interface={:?}", local_addr);
}

fn spawn_session(
    transport: TcpTransport,
    receiver: SessionReceiver,
    handle: Arc<dyn SessionHandle>,
    dispatcher: Arc<Dispatcher>,
    streams: Arc<StreamManager>,
    params: SessionParams,
) {
    let refs = ReferenceList::new();

    tokio::spawn(async move {
        drive(
            transport, receiver, handle, dispatcher, streams, refs, params,
        )
        .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_extraction_waits_for_completion() {
        let mut rx = BytesMut::new();

        // Frame: size = 16 body bytes following the size field.
        let mut frame = vec![];
        frame.extend_from_slice(&16u32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]);

        rx.extend_from_slice(&frame[..10]);
        assert!(extract_frame(&mut rx, 1024).unwrap().is_none());

        rx.extend_from_slice(&frame[10..]);
        let parsed = extract_frame(&mut rx, 1024).unwrap().unwrap();
        assert_eq!(parsed.len(), 20);
        assert!(rx.is_empty());
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut rx = BytesMut::new();
        rx.extend_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());

        assert!(extract_frame(&mut rx, codec::MAX_MESSAGE_SIZE).is_err());
    }

    #[test]
    fn undersize_frame_is_fatal() {
        let mut rx = BytesMut::new();
        rx.extend_from_slice(&4u32.to_le_bytes());
        rx.extend_from_slice(&[0u8; 4]);

        assert!(extract_frame(&mut rx, codec::MAX_MESSAGE_SIZE).is_err());
    }
}
