//! Chunked transfers.
//!
//! A stream is a session-scoped, windowed sequence of data chunks,
//! correlated by stream id and therefore free to interleave with pending
//! requests. The producing side holds a [`StreamWriter`] whose send
//! credits start at the window size and are replenished by
//! `StreamWindowUpdate` frames; the consuming side holds a
//! [`StreamReader`] over a bounded chunk queue and emits one window update
//! per consumed chunk. Either side can cancel; a producer failure travels
//! as `StreamError`.

use crate::{
    Error,
    object::SessionHandle,
    session::Work,
};

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    FlatBuffer,
    header::{
        MESSAGE_HEADER_SIZE, MessageHeader, MessageId, MessageType, STREAM_HEADER_SIZE,
        StreamHeader,
    },
};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

/// Chunks an inbound stream buffers before the consumer drains them; also
/// the producer's initial credit.
pub const DEFAULT_WINDOW: usize = 16;

/// Where chunk payload starts inside a stream frame.
pub const STREAM_PAYLOAD_OFFSET: usize = MESSAGE_HEADER_SIZE + STREAM_HEADER_SIZE;

/// Borrow the payload of a `StreamDataChunk` frame.
pub fn chunk_data(frame: &FlatBuffer) -> Result<&[u8], Error> {
    let total = frame.write_pos();
    if total < STREAM_PAYLOAD_OFFSET {
        return Err(Error::BadFrame);
    }

    Ok(frame.get(STREAM_PAYLOAD_OFFSET, total - STREAM_PAYLOAD_OFFSET)?)
}

/// Build a complete stream frame.
pub fn encode_stream_frame(
    msg_id: MessageId,
    header: StreamHeader,
    payload: &[u8],
) -> Result<FlatBuffer, Error> {
    let mut buf = FlatBuffer::new();
    let base = MessageHeader::new(msg_id, MessageType::Request, 0).encode(&mut buf)?;
    header.encode(&mut buf)?;

    if !payload.is_empty() {
        buf.prepare(payload.len())?.copy_from_slice(payload);
        buf.commit(payload.len());
    }

    MessageHeader::patch_size(&mut buf, base)?;
    Ok(buf)
}

struct OutboundEntry {
    credits: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

struct InboundEntry {
    /// Dropped on completion; an empty queue with no sender is the
    /// reader's end-of-stream.
    chunks: Option<mpsc::Sender<Result<FlatBuffer, Error>>>,
    /// Present until a reader attaches, so chunks (and even completion)
    /// racing ahead of the attach stay buffered.
    handoff: Option<mpsc::Receiver<Result<FlatBuffer, Error>>>,
}

/// Per-session registry of active streams, both directions.
#[derive(Default)]
pub struct StreamManager {
    outbound: Mutex<HashMap<u32, OutboundEntry>>,
    inbound: Mutex<HashMap<u32, InboundEntry>>,
    next_stream_id: AtomicU32,
}

impl StreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbound: Mutex::new(HashMap::with_capacity(8)),
            inbound: Mutex::new(HashMap::with_capacity(8)),
            next_stream_id: AtomicU32::new(0),
        })
    }

    /// Open an outbound stream over `session` and announce it to the
    /// peer. The returned writer owns the window credits.
    pub fn open_writer(
        self: &Arc<Self>,
        session: Arc<dyn SessionHandle>,
    ) -> Result<StreamWriter, Error> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
        let credits = Arc::new(Semaphore::new(DEFAULT_WINDOW));
        let cancelled = Arc::new(AtomicBool::new(false));

        self.outbound.lock().insert(
            stream_id,
            OutboundEntry {
                credits: credits.clone(),
                cancelled: cancelled.clone(),
            },
        );

        let init = encode_stream_frame(
            MessageId::StreamInitialization,
            StreamHeader {
                stream_id,
                sequence: 0,
                arg: DEFAULT_WINDOW as u32,
            },
            &[],
        )?;
        session.submit(Work::Stream { buf: init })?;

        Ok(StreamWriter {
            stream_id,
            sequence: 0,
            session,
            credits,
            cancelled,
            manager: Arc::downgrade(self),
            done: false,
        })
    }

    /// Attach a reader to an inbound stream id (learned from a reply).
    /// Chunks that raced ahead of the attach are already buffered.
    pub fn open_reader(
        self: &Arc<Self>,
        stream_id: u32,
        session: Arc<dyn SessionHandle>,
    ) -> Result<StreamReader, Error> {
        let mut inbound = self.inbound.lock();
        let entry = inbound
            .entry(stream_id)
            .or_insert_with(Self::new_inbound_entry);

        let chunks = entry.handoff.take().ok_or(Error::Protocol)?;

        // An already-completed stream has nothing left to register; the
        // reader drains what was buffered and sees the end.
        if entry.chunks.is_none() {
            inbound.remove(&stream_id);
        }

        Ok(StreamReader {
            stream_id,
            chunks,
            session,
            manager: Arc::downgrade(self),
            done: false,
        })
    }

    fn new_inbound_entry() -> InboundEntry {
        let (tx, rx) = mpsc::channel(DEFAULT_WINDOW);
        InboundEntry {
            chunks: Some(tx),
            handoff: Some(rx),
        }
    }

    /// Route one stream frame. The session driver calls this for every
    /// frame whose message id is in the stream range.
    pub fn route(&self, frame: FlatBuffer) -> Result<(), Error> {
        let header = MessageHeader::decode(&frame, 0)?;
        let stream = StreamHeader::decode(&frame, MESSAGE_HEADER_SIZE)?;

        match header.msg_id {
            MessageId::StreamInitialization => {
                self.inbound
                    .lock()
                    .entry(stream.stream_id)
                    .or_insert_with(Self::new_inbound_entry);
            }
            MessageId::StreamDataChunk => {
                let sender = {
                    let mut inbound = self.inbound.lock();
                    inbound
                        .entry(stream.stream_id)
                        .or_insert_with(Self::new_inbound_entry)
                        .chunks
                        .clone()
                };

                match sender.map(|sender| sender.try_send(Ok(frame))) {
                    Some(Ok(())) => {}
                    Some(Err(mpsc::error::TrySendError::Full(_))) => {
                        // The peer ignored our window; drop the chunk.
                        log::warn!(
                            "stream window violated: stream_id={}, seq={}",
                            stream.stream_id,
                            stream.sequence
                        );
                    }
                    Some(Err(mpsc::error::TrySendError::Closed(_))) | None => {
                        log::debug!(
                            "chunk for dead stream dropped: stream_id={}",
                            stream.stream_id
                        );
                    }
                }
            }
            MessageId::StreamCompletion => {
                self.finish_inbound(stream.stream_id, None);
            }
            MessageId::StreamError => {
                self.finish_inbound(stream.stream_id, Some(Error::Protocol));
                log::warn!(
                    "stream failed by peer: stream_id={}, code={}",
                    stream.stream_id,
                    stream.arg
                );
            }
            MessageId::StreamWindowUpdate => {
                if let Some(entry) = self.outbound.lock().get(&stream.stream_id) {
                    entry.credits.add_permits(stream.arg as usize);
                }
            }
            MessageId::StreamCancel => {
                if let Some(entry) = self.outbound.lock().remove(&stream.stream_id) {
                    entry.cancelled.store(true, Ordering::Relaxed);
                    entry.credits.close();
                }
            }
            _ => return Err(Error::Protocol),
        }

        Ok(())
    }

    /// End an inbound stream: push the terminal error (if any), drop the
    /// sender so the reader sees the end, and keep the entry only while
    /// an unattached reader might still come for the buffered tail.
    fn finish_inbound(&self, stream_id: u32, error: Option<Error>) {
        let mut inbound = self.inbound.lock();

        let remove = if let Some(entry) = inbound.get_mut(&stream_id) {
            if let Some(error) = error
                && let Some(chunks) = &entry.chunks
            {
                let _ = chunks.try_send(Err(error));
            }

            entry.chunks = None;
            entry.handoff.is_none()
        } else {
            false
        };

        if remove {
            inbound.remove(&stream_id);
        }
    }

    /// Session teardown: cancel every producer, fail every consumer.
    pub fn abort_all(&self) {
        for (_, entry) in self.outbound.lock().drain() {
            entry.cancelled.store(true, Ordering::Relaxed);
            entry.credits.close();
        }

        for (_, entry) in self.inbound.lock().drain() {
            if let Some(chunks) = &entry.chunks {
                let _ = chunks.try_send(Err(Error::CommFailure));
            }
        }
    }

    fn forget_outbound(&self, stream_id: u32) {
        self.outbound.lock().remove(&stream_id);
    }

    fn forget_inbound(&self, stream_id: u32) {
        self.inbound.lock().remove(&stream_id);
    }
}

/// Producing end of an outbound stream.
pub struct StreamWriter {
    stream_id: u32,
    sequence: u32,
    session: Arc<dyn SessionHandle>,
    credits: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
    manager: Weak<StreamManager>,
    done: bool,
}

impl StreamWriter {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Send one chunk, waiting for window credit first.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::OperationAborted);
        }

        match self.credits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(Error::OperationAborted),
        }

        let frame = encode_stream_frame(
            MessageId::StreamDataChunk,
            StreamHeader {
                stream_id: self.stream_id,
                sequence: self.sequence,
                arg: 0,
            },
            data,
        )?;

        self.sequence = self.sequence.wrapping_add(1);
        self.session.submit(Work::Stream { buf: frame })
    }

    /// Emit the completion frame carrying the final sequence.
    pub fn finish(mut self) -> Result<(), Error> {
        self.done = true;
        self.deregister();

        let frame = encode_stream_frame(
            MessageId::StreamCompletion,
            StreamHeader {
                stream_id: self.stream_id,
                sequence: self.sequence,
                arg: self.sequence,
            },
            &[],
        )?;

        self.session.submit(Work::Stream { buf: frame })
    }

    /// Emit a stream error with a producer-defined code.
    pub fn fail(mut self, code: u32) -> Result<(), Error> {
        self.done = true;
        self.deregister();

        let frame = encode_stream_frame(
            MessageId::StreamError,
            StreamHeader {
                stream_id: self.stream_id,
                sequence: self.sequence,
                arg: code,
            },
            &[],
        )?;

        self.session.submit(Work::Stream { buf: frame })
    }

    fn deregister(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_outbound(self.stream_id);
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        // An abandoned producer is an error, not a clean end.
        self.deregister();
        if let Ok(frame) = encode_stream_frame(
            MessageId::StreamError,
            StreamHeader {
                stream_id: self.stream_id,
                sequence: self.sequence,
                arg: 0,
            },
            &[],
        ) {
            let _ = self.session.submit(Work::Stream { buf: frame });
        }
    }
}

/// Consuming end of an inbound stream.
pub struct StreamReader {
    stream_id: u32,
    chunks: mpsc::Receiver<Result<FlatBuffer, Error>>,
    session: Arc<dyn SessionHandle>,
    manager: Weak<StreamManager>,
    done: bool,
}

impl StreamReader {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// The next chunk frame, `None` after clean completion. Consuming a
    /// chunk hands one window credit back to the producer.
    pub async fn next(&mut self) -> Option<Result<FlatBuffer, Error>> {
        match self.chunks.recv().await {
            Some(Ok(frame)) => {
                let update = encode_stream_frame(
                    MessageId::StreamWindowUpdate,
                    StreamHeader {
                        stream_id: self.stream_id,
                        sequence: 0,
                        arg: 1,
                    },
                    &[],
                );
                if let Ok(update) = update {
                    let _ = self.session.submit(Work::Stream { buf: update });
                }

                Some(Ok(frame))
            }
            Some(Err(error)) => {
                self.done = true;
                Some(Err(error))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_inbound(self.stream_id);
        }

        if self.done {
            return;
        }

        // Abandoning mid-stream tells the producer to stop scheduling.
        if let Ok(frame) = encode_stream_frame(
            MessageId::StreamCancel,
            StreamHeader {
                stream_id: self.stream_id,
                sequence: 0,
                arg: 0,
            },
            &[],
        ) {
            let _ = self.session.submit(Work::Stream { buf: frame });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::endpoint::EndPoint;
    use std::net::Ipv4Addr;

    /// A session that loops every submitted stream frame back into a
    /// channel for inspection.
    struct LoopSession {
        sent: mpsc::UnboundedSender<FlatBuffer>,
        remote: EndPoint,
    }

    fn loop_session() -> (Arc<LoopSession>, mpsc::UnboundedReceiver<FlatBuffer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(LoopSession {
                sent: tx,
                remote: EndPoint::tcp(Ipv4Addr::LOCALHOST, 1),
            }),
            rx,
        )
    }

    impl SessionHandle for LoopSession {
        fn submit(&self, work: Work) -> Result<(), Error> {
            match work {
                Work::Stream { buf } => {
                    let _ = self.sent.send(buf);
                    Ok(())
                }
                _ => Err(Error::Protocol),
            }
        }

        fn remote_endpoint(&self) -> &EndPoint {
            &self.remote
        }
    }

    #[tokio::test]
    async fn writer_respects_window() {
        let (session, mut wire) = loop_session();
        let manager = StreamManager::new();
        let mut writer = manager.open_writer(session).unwrap();

        // Init frame went out first.
        let init = wire.recv().await.unwrap();
        assert_eq!(
            MessageHeader::decode(&init, 0).unwrap().msg_id,
            MessageId::StreamInitialization
        );

        for chunk in 0..DEFAULT_WINDOW {
            writer.send(&[chunk as u8]).await.unwrap();
        }

        // Credits exhausted; the next send parks until an update arrives.
        let mut pending = Box::pin(writer.send(b"blocked"));
        tokio::select! {
            _ = &mut pending => panic!("send proceeded without credit"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }

        let update = encode_stream_frame(
            MessageId::StreamWindowUpdate,
            StreamHeader {
                stream_id: 1,
                sequence: 0,
                arg: 1,
            },
            &[],
        )
        .unwrap();
        manager.route(update).unwrap();

        pending.await.unwrap();
    }

    #[tokio::test]
    async fn reader_sees_chunks_then_completion() {
        let (session, mut wire) = loop_session();
        let manager = StreamManager::new();

        for seq in 0..3u32 {
            let chunk = encode_stream_frame(
                MessageId::StreamDataChunk,
                StreamHeader {
                    stream_id: 7,
                    sequence: seq,
                    arg: 0,
                },
                &[seq as u8; 4],
            )
            .unwrap();
            manager.route(chunk).unwrap();
        }

        let done = encode_stream_frame(
            MessageId::StreamCompletion,
            StreamHeader {
                stream_id: 7,
                sequence: 3,
                arg: 3,
            },
            &[],
        )
        .unwrap();
        manager.route(done).unwrap();

        let mut reader = manager.open_reader(7, session).unwrap();
        for seq in 0..3u32 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(chunk_data(&frame).unwrap(), &[seq as u8; 4]);

            // Each consumed chunk pushed a window update onto the wire.
            let update = wire.recv().await.unwrap();
            assert_eq!(
                MessageHeader::decode(&update, 0).unwrap().msg_id,
                MessageId::StreamWindowUpdate
            );
        }

        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_unblocks_the_producer() {
        let (session, _wire) = loop_session();
        let manager = StreamManager::new();
        let mut writer = manager.open_writer(session).unwrap();
        let stream_id = writer.stream_id();

        for _ in 0..DEFAULT_WINDOW {
            writer.send(b"x").await.unwrap();
        }

        let cancel = encode_stream_frame(
            MessageId::StreamCancel,
            StreamHeader {
                stream_id,
                sequence: 0,
                arg: 0,
            },
            &[],
        )
        .unwrap();
        manager.route(cancel).unwrap();

        assert!(matches!(
            writer.send(b"after-cancel").await,
            Err(Error::OperationAborted)
        ));
    }

    #[tokio::test]
    async fn teardown_fails_consumers() {
        let (session, _wire) = loop_session();
        let manager = StreamManager::new();

        let chunk = encode_stream_frame(
            MessageId::StreamDataChunk,
            StreamHeader {
                stream_id: 2,
                sequence: 0,
                arg: 0,
            },
            &[1],
        )
        .unwrap();
        manager.route(chunk).unwrap();

        let mut reader = manager.open_reader(2, session).unwrap();
        manager.abort_all();

        // The buffered chunk drains first, then the abort surfaces.
        assert!(matches!(reader.next().await, Some(Ok(_))));
        assert!(matches!(
            reader.next().await,
            Some(Err(Error::CommFailure))
        ));
    }
}
