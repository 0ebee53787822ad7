//! Raw epoll TCP ingress.
//!
//! The alternative to the async acceptor: one dedicated thread, an
//! edge-triggered epoll set, and plain syscalls. Every wake drains each
//! readable socket completely, parses whole frames out of the per-socket
//! accumulator, dispatches them inline, and writes the reply with a
//! blocking send that falls back to `poll(POLLOUT)` on a full socket
//! buffer. Selected with `use_epoll_tcp`; frame semantics are identical
//! to the async path, so peers cannot tell the two apart.

use crate::{rpc::Dispatcher, transport::tcp};

use std::{
    io::{self, Read},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use codec::{
    endpoint::{EndPoint, TransportKind},
    header::{MessageHeader, MessageId, MessageType},
};
use service::ReferenceList;

/// How long a blocked reply write waits for the socket to drain.
const SEND_POLL_TIMEOUT_MS: libc::c_int = 5_000;

/// Epoll wake deadline; bounds shutdown latency.
const WAIT_TIMEOUT_MS: libc::c_int = 100;

struct Conn {
    stream: TcpStream,
    rx: BytesMut,
    refs: Arc<ReferenceList>,
    remote: EndPoint,
}

pub struct EpollServer {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl EpollServer {
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        addr: SocketAddr,
        max_message: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name("tcp-epoll".to_string())
            .spawn(move || {
                if let Err(err) = run(listener, dispatcher, max_message, flag) {
                    log::error!("epoll server failed: err={}", err);
                }
            })?;

        log::info!("epoll tcp server listening: interface={}", local_addr);

        Ok(Self {
            running,
            thread: Some(thread),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EpollServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn epoll_add(epfd: RawFd, fd: RawFd, events: u32) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events,
        u64: fd as u64,
    };

    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn run(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_message: usize,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let epfd = unsafe { libc::epoll_create1(0) };
    if epfd < 0 {
        return Err(io::Error::last_os_error());
    }

    let listen_fd = listener.as_raw_fd();
    epoll_add(epfd, listen_fd, libc::EPOLLIN as u32)?;

    let mut conns: HashMap<RawFd, Conn> = HashMap::with_capacity(64);
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];

    while running.load(Ordering::Relaxed) {
        let ready = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, WAIT_TIMEOUT_MS)
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        for event in &events[..ready as usize] {
            let fd = event.u64 as RawFd;

            if fd == listen_fd {
                accept_all(&listener, epfd, &mut conns);
                continue;
            }

            let hangup = event.events
                & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32 | libc::EPOLLERR as u32)
                != 0;
            let readable = event.events & libc::EPOLLIN as u32 != 0;

            let dead = if readable {
                conns
                    .get_mut(&fd)
                    .map(|conn| !service_conn(conn, &dispatcher, max_message))
                    .unwrap_or(false)
                    || hangup
            } else {
                hangup
            };

            if dead && let Some(conn) = conns.remove(&fd) {
                close_conn(conn, &dispatcher);
            }
        }
    }

    // Shutdown: every live connection releases its tethered objects.
    for (_, conn) in conns.drain() {
        close_conn(conn, &dispatcher);
    }

    unsafe { libc::close(epfd) };
    Ok(())
}

fn accept_all(listener: &TcpListener, epfd: RawFd, conns: &mut HashMap<RawFd, Conn>) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let SocketAddr::V4(v4) = addr else {
                    continue;
                };

                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                tcp::tune_fd(stream.as_raw_fd());

                let fd = stream.as_raw_fd();
                let flags =
                    libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32 | libc::EPOLLET as u32;
                if let Err(err) = epoll_add(epfd, fd, flags) {
                    log::warn!("epoll add failed: addr={}, err={}", addr, err);
                    continue;
                }

                log::info!("tcp socket accept: addr={:?} (epoll)", addr);

                conns.insert(
                    fd,
                    Conn {
                        stream,
                        rx: BytesMut::with_capacity(16 * 1024),
                        refs: ReferenceList::new(),
                        remote: EndPoint::tcp(*v4.ip(), v4.port()),
                    },
                );
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("epoll accept failed: err={}", err);
                break;
            }
        }
    }
}

/// Drain the socket completely (edge-triggered contract), dispatch every
/// complete frame, reply in place. Returns false once the connection is
/// done for.
fn service_conn(conn: &mut Conn, dispatcher: &Arc<Dispatcher>, max_message: usize) -> bool {
    let mut scratch = [0u8; 64 * 1024];

    loop {
        match conn.stream.read(&mut scratch) {
            Ok(0) => return false,
            Ok(n) => conn.rx.extend_from_slice(&scratch[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("epoll read failed: remote={}, err={}", conn.remote, err);
                return false;
            }
        }
    }

    loop {
        let frame = match tcp::extract_frame(&mut conn.rx, max_message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return true,
            Err(err) => {
                log::warn!("epoll bad frame: remote={}, err={}", conn.remote, err);
                return false;
            }
        };

        let header = match MessageHeader::decode(&frame, 0) {
            Ok(header) => header,
            Err(_) => continue,
        };

        match (header.msg_type, header.msg_id) {
            (MessageType::Request, MessageId::FunctionCall) => {
                let reply = dispatcher.dispatch_frame(
                    frame,
                    &conn.remote,
                    &conn.refs,
                    None,
                    None,
                    TransportKind::Tcp,
                    false,
                );

                if let Some(reply) = reply
                    && let Err(err) = send_all(conn.stream.as_raw_fd(), reply.data())
                {
                    log::warn!("epoll reply send failed: remote={}, err={}", conn.remote, err);
                    return false;
                }
            }
            (MessageType::Request, MessageId::ReleaseObject) => {
                dispatcher.release_frame(&frame, &conn.refs);
            }
            (_, other) => {
                log::warn!(
                    "epoll unsupported message dropped: remote={}, msg_id={:?}",
                    conn.remote,
                    other
                );
            }
        }
    }
}

fn close_conn(conn: Conn, dispatcher: &Arc<Dispatcher>) {
    dispatcher.release_session(&conn.refs);
    log::info!("tcp socket disconnect: remote={} (epoll)", conn.remote);
}

/// Blocking write on a nonblocking socket: spin the syscall, parking in
/// `poll(POLLOUT)` for up to five seconds when the buffer is full.
fn send_all(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let sent = unsafe {
            libc::send(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                libc::MSG_NOSIGNAL,
            )
        };

        if sent > 0 {
            bytes = &bytes[sent as usize..];
            continue;
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                let mut pollfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };

                let ready = unsafe { libc::poll(&mut pollfd, 1, SEND_POLL_TIMEOUT_MS) };
                if ready == 0 {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                if ready < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
            _ => return Err(err),
        }
    }

    Ok(())
}
