//! Shared-memory transport.
//!
//! A session here is a ring-pair channel plus the usual session state.
//! There is no async driver: submission writes straight into the send
//! ring, and the channel's reader thread handles inbound frames — request
//! frames dispatch on a zero-copy view over ring memory (the record is
//! only committed, and the peer's space reclaimed, after dispatch
//! returns), answers correlate against the pending ledger, stream frames
//! route to the stream manager.

use crate::rpc::Dispatcher;

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    header::{MessageHeader, MessageId, MessageType},
};
use parking_lot::Mutex;
use service::{
    Error, ReferenceList, SessionHandle,
    session::{Correlator, MAX_PENDING_REQUESTS, Work},
    stream::StreamManager,
};
use shm::{ReadView, ShmChannel, ShmListener};

fn map_shm_error(error: &shm::Error) -> Error {
    match error {
        shm::Error::BufferFull => Error::BufferFull,
        shm::Error::MessageTooLarge => Error::MessageTooLarge,
        shm::Error::Timeout => Error::Timeout,
        _ => Error::CommFailure,
    }
}

pub struct ShmSession {
    channel: Arc<ShmChannel>,
    correlator: Mutex<Correlator>,
    streams: Arc<StreamManager>,
    refs: Arc<ReferenceList>,
    remote: EndPoint,
    dispatcher: Arc<Dispatcher>,
    max_message: usize,
}

impl ShmSession {
    fn new(
        channel: Arc<ShmChannel>,
        dispatcher: Arc<Dispatcher>,
        remote: EndPoint,
        max_message: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            correlator: Mutex::new(Correlator::new(Default::default())),
            streams: StreamManager::new(),
            refs: ReferenceList::new(),
            remote,
            dispatcher,
            max_message,
        })
    }

    pub fn streams(&self) -> Arc<StreamManager> {
        self.streams.clone()
    }

    /// Start the reader thread and the deadline watcher.
    fn start(self: &Arc<Self>) {
        let this = self.clone();
        // The thread exits on its own once the channel stops.
        let _ = self.channel.start_reader(move |view| this.on_frame(view));

        // Head-of-queue timeouts need a clock even when the ring is
        // quiet; a small watcher thread provides it.
        let weak: Weak<Self> = Arc::downgrade(self);
        let _ = std::thread::Builder::new()
            .name("shm-timeouts".to_string())
            .spawn(move || {
                while let Some(this) = weak.upgrade() {
                    if !this.channel.is_running() {
                        break;
                    }

                    this.correlator
                        .lock()
                        .expire_head(tokio::time::Instant::now());
                    drop(this);
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
            .expect("spawn shm timeout watcher");
    }

    /// One inbound frame, still inside ring memory.
    fn on_frame(self: &Arc<Self>, view: &ReadView<'_>) {
        let bytes = view.as_slice();
        if bytes.len() < codec::header::MESSAGE_HEADER_SIZE {
            log::warn!("shm truncated frame dropped: channel={}", self.channel.id());
            return;
        }

        // Read-only view over the ring payload; valid until this function
        // returns and the record is committed.
        let frame = unsafe { FlatBuffer::view(view.payload_ptr(), bytes.len(), bytes.len()) };

        let header = match MessageHeader::decode(&frame, 0) {
            Ok(header) => header,
            Err(err) => {
                log::warn!(
                    "shm bad frame dropped: channel={}, err={}",
                    self.channel.id(),
                    err
                );
                return;
            }
        };

        if header.size as usize + 4 != bytes.len() || bytes.len() > self.max_message {
            log::warn!(
                "shm frame size mismatch dropped: channel={}",
                self.channel.id()
            );
            return;
        }

        if header.msg_id.is_stream() {
            // Stream frames outlive the ring view.
            if let Err(err) = self.streams.route(frame.clone()) {
                log::warn!(
                    "shm stream frame dropped: channel={}, err={}",
                    self.channel.id(),
                    err
                );
            }
            return;
        }

        match header.msg_type {
            MessageType::Request => match header.msg_id {
                MessageId::FunctionCall => {
                    let session: Arc<dyn SessionHandle> = self.clone();
                    let reply = self.dispatcher.dispatch_frame(
                        frame,
                        &self.remote,
                        &self.refs,
                        Some(self.streams.clone()),
                        Some(session),
                        TransportKind::SharedMemory,
                        false,
                    );

                    if let Some(reply) = reply
                        && let Err(err) = self.channel.send(reply.data())
                    {
                        log::warn!(
                            "shm reply send failed: channel={}, err={}",
                            self.channel.id(),
                            err
                        );
                    }
                }
                MessageId::ReleaseObject => {
                    self.dispatcher.release_frame(&frame, &self.refs);
                }
                other => {
                    log::warn!(
                        "shm unexpected request dropped: channel={}, msg_id={:?}",
                        self.channel.id(),
                        other
                    );
                }
            },
            MessageType::Answer => {
                // The answer escapes the dispatch scope, so it leaves the
                // ring as a copy.
                self.correlator.lock().complete(&header, frame.clone());
            }
        }
    }
}

impl SessionHandle for ShmSession {
    fn submit(&self, work: Work) -> Result<(), Error> {
        if !self.channel.is_running() {
            work.fail(Error::CommFailure);
            return Err(Error::CommFailure);
        }

        if work.buffer().map(|buf| buf.len() > self.max_message).unwrap_or(false) {
            work.fail(Error::MessageTooLarge);
            return Err(Error::MessageTooLarge);
        }

        match work {
            Work::Request {
                mut buf,
                reply,
                timeout,
            } => {
                let mut correlator = self.correlator.lock();
                if correlator.len() >= MAX_PENDING_REQUESTS {
                    let _ = reply.send(Err(Error::BufferFull));
                    return Err(Error::BufferFull);
                }

                let request_id = correlator.register(&mut buf, reply, timeout)?;
                if let Err(err) = self.channel.send(buf.data()) {
                    correlator.fail_tail(request_id, map_shm_error(&err));
                    return Err(map_shm_error(&err));
                }

                Ok(())
            }
            Work::Oneway { buf } | Work::Stream { buf } => self
                .channel
                .send(buf.data())
                .map_err(|err| map_shm_error(&err)),
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
        self.channel.is_running()
    }

    fn close(&self) {
        self.channel.stop();
        self.correlator.lock().abort_all();
        self.streams.abort_all();
        self.dispatcher.release_session(&self.refs);
    }
}

/// Server-side sessions created by the accept thread, tracked so
/// shutdown can stop their reader threads.
#[derive(Default)]
pub struct ShmRegistry {
    sessions: Mutex<Vec<Arc<ShmSession>>>,
}

impl ShmRegistry {
    pub fn close_all(&self) {
        for session in self.sessions.lock().drain(..) {
            session.close();
        }
    }
}

/// Start accepting shared-memory peers on a bound listener.
pub fn listen(
    listener: &Arc<ShmListener>,
    dispatcher: Arc<Dispatcher>,
    ring_capacity: usize,
    max_message: usize,
) -> Arc<ShmRegistry> {
    let registry = Arc::new(ShmRegistry::default());
    let accepted = registry.clone();

    let _ = listener.start(ring_capacity, move |channel| {
        let remote = EndPoint {
            kind: codec::endpoint::TransportKind::SharedMemoryTethered,
            ssl: false,
            host: codec::endpoint::HostId::Channel(channel.id().to_string()),
        };

        let session = ShmSession::new(
            Arc::new(channel),
            dispatcher.clone(),
            remote,
            max_message,
        );
        session.start();
        accepted.sessions.lock().push(session);
    });

    log::info!("shm transport listening: name={}", listener.name());
    registry
}

/// Client-side connect to a listener name.
pub fn connect(
    dispatcher: Arc<Dispatcher>,
    endpoint: EndPoint,
    max_message: usize,
) -> Result<(Arc<dyn SessionHandle>, Arc<StreamManager>), Error> {
    let name = endpoint.channel_id().ok_or(Error::CommFailure)?;

    let channel = ShmListener::connect(name).map_err(|err| map_shm_error(&err))?;
    let session = ShmSession::new(Arc::new(channel), dispatcher, endpoint.clone(), max_message);
    session.start();

    let streams = session.streams();
    Ok((session, streams))
}
