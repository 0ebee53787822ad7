//! Transport-agnostic session state.
//!
//! A session is a work queue in front of a wire. Proxies enqueue
//! [`Work`] items; the transport driver pops them in order, stamps
//! request ids, and correlates answers FIFO against the pending ledger.
//! The types here hold all of that state; the async loop that binds them
//! to a concrete transport lives with the transports.

use crate::{Error, object::SessionHandle};

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use codec::{FlatBuffer, endpoint::EndPoint, flat, header::MessageHeader};

use tokio::{sync::mpsc, sync::oneshot, time::Instant};

/// In-flight requests a session tolerates before submissions fail.
pub const MAX_PENDING_REQUESTS: usize = 1000;

/// Queued outbound messages a session tolerates before submissions fail.
pub const MAX_WRITE_QUEUE: usize = 100;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// One unit of outbound work.
pub enum Work {
    /// A call expecting a correlated answer. The driver assigns the
    /// request id and completes `reply` when the answer (or a failure)
    /// arrives.
    Request {
        buf: FlatBuffer,
        reply: oneshot::Sender<Result<FlatBuffer, Error>>,
        timeout: Duration,
    },
    /// Fire-and-forget; complete as soon as the transport accepts it.
    Oneway { buf: FlatBuffer },
    /// Stream frame; interleaves with pending requests because it is
    /// correlated by stream id, not request id.
    Stream { buf: FlatBuffer },
    /// Ask the session to wind down; everything still queued behind it
    /// fails with `OperationAborted`.
    Close,
}

impl Work {
    pub fn buffer(&self) -> Option<&FlatBuffer> {
        match self {
            Work::Request { buf, .. } | Work::Oneway { buf } | Work::Stream { buf } => Some(buf),
            Work::Close => None,
        }
    }

    /// Fail the work without touching the wire.
    pub fn fail(self, error: Error) {
        if let Work::Request { reply, .. } = self {
            let _ = reply.send(Err(error));
        }
    }
}

/// The proxy-facing half of a session: a bounded submit queue plus the
/// shared counters the limits are enforced against.
pub struct SessionSender {
    queue: mpsc::Sender<Work>,
    pending: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
    remote: EndPoint,
}

impl SessionSender {
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

impl SessionHandle for SessionSender {
    fn submit(&self, work: Work) -> Result<(), Error> {
        if !self.is_open() {
            work.fail(Error::CommFailure);
            return Err(Error::CommFailure);
        }

        if matches!(work, Work::Request { .. })
            && self.pending.load(Ordering::Relaxed) >= MAX_PENDING_REQUESTS
        {
            work.fail(Error::BufferFull);
            return Err(Error::BufferFull);
        }

        match self.queue.try_send(work) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(work)) => {
                work.fail(Error::BufferFull);
                Err(Error::BufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(work)) => {
                work.fail(Error::CommFailure);
                Err(Error::CommFailure)
            }
        }
    }

    fn remote_endpoint(&self) -> &EndPoint {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.queue.is_closed()
    }

    fn close(&self) {
        // Let the driver see the close marker before submissions stop.
        let _ = self.queue.try_send(Work::Close);
        self.open.store(false, Ordering::Relaxed);
    }
}

/// Create the queue pair for one session. The driver keeps the receiver;
/// proxies clone the sender.
pub fn session_queue(remote: EndPoint) -> (Arc<SessionSender>, SessionReceiver) {
    let (tx, rx) = mpsc::channel(MAX_WRITE_QUEUE);
    let pending = Arc::new(AtomicUsize::new(0));
    let open = Arc::new(AtomicBool::new(true));

    (
        Arc::new(SessionSender {
            queue: tx,
            pending: pending.clone(),
            open: open.clone(),
            remote,
        }),
        SessionReceiver {
            queue: rx,
            pending,
            open,
        },
    )
}

/// The driver-facing half: the queue receiver plus the shared counters.
pub struct SessionReceiver {
    pub queue: mpsc::Receiver<Work>,
    pending: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl SessionReceiver {
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }
}

struct PendingCall {
    request_id: u32,
    reply: oneshot::Sender<Result<FlatBuffer, Error>>,
    deadline: Instant,
}

/// FIFO ledger of sent-but-unanswered requests.
///
/// Within a session, requests hit the wire in enqueue order and answers
/// come back in the same order, so correlation is head-of-queue; the
/// request id is carried anyway and verified, because a peer that
/// disagrees about ordering is a protocol error worth surfacing.
pub struct Correlator {
    queue: VecDeque<PendingCall>,
    pending: Arc<AtomicUsize>,
    next_request_id: u32,
}

impl Correlator {
    pub fn new(pending: Arc<AtomicUsize>) -> Self {
        Self {
            queue: VecDeque::new(),
            pending,
            next_request_id: 0,
        }
    }

    /// Stamp a fresh request id into the frame (offset 8 of the header)
    /// and register the pending call. Zero is reserved for
    /// fire-and-forget, so the counter skips it on wrap.
    pub fn register(
        &mut self,
        buf: &mut FlatBuffer,
        reply: oneshot::Sender<Result<FlatBuffer, Error>>,
        timeout: Duration,
    ) -> Result<u32, Error> {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == 0 {
            self.next_request_id = 1;
        }

        let request_id = self.next_request_id;
        flat::put(buf, 8, request_id)?;

        self.queue.push_back(PendingCall {
            request_id,
            reply,
            deadline: Instant::now() + timeout,
        });
        self.pending.fetch_add(1, Ordering::Relaxed);

        Ok(request_id)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Deadline of the head-of-queue call, the only one a session timer
    /// needs to watch.
    pub fn head_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|call| call.deadline)
    }

    /// Correlate an answer frame with the head of the queue.
    pub fn complete(&mut self, header: &MessageHeader, answer: FlatBuffer) {
        match self.queue.pop_front() {
            Some(call) => {
                self.pending.fetch_sub(1, Ordering::Relaxed);

                if call.request_id != header.request_id {
                    log::warn!(
                        "answer out of order: expected={}, got={}",
                        call.request_id,
                        header.request_id
                    );
                    let _ = call.reply.send(Err(Error::Protocol));
                } else {
                    let _ = call.reply.send(Ok(answer));
                }
            }
            None => {
                log::warn!(
                    "unsolicited answer dropped: request_id={}",
                    header.request_id
                );
            }
        }
    }

    /// Back out the most recent registration after its send failed; the
    /// caller gets the send error instead of waiting for a timeout.
    pub fn fail_tail(&mut self, request_id: u32, error: Error) {
        if self
            .queue
            .back()
            .map(|call| call.request_id == request_id)
            .unwrap_or(false)
        {
            let call = self.queue.pop_back().unwrap();
            self.pending.fetch_sub(1, Ordering::Relaxed);
            let _ = call.reply.send(Err(error));
        }
    }

    /// Fail the head call if its deadline has passed, freeing its slot.
    pub fn expire_head(&mut self, now: Instant) -> bool {
        if self
            .queue
            .front()
            .map(|call| call.deadline <= now)
            .unwrap_or(false)
        {
            let call = self.queue.pop_front().unwrap();
            self.pending.fetch_sub(1, Ordering::Relaxed);
            let _ = call.reply.send(Err(Error::Timeout));
            return true;
        }

        false
    }

    /// Session teardown: every outstanding call fails with
    /// `OperationAborted`.
    pub fn abort_all(&mut self) {
        while let Some(call) = self.queue.pop_front() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            let _ = call.reply.send(Err(Error::OperationAborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::header::{MessageId, MessageType};
    use std::net::Ipv4Addr;

    fn request_frame() -> FlatBuffer {
        let mut buf = FlatBuffer::new();
        let base = MessageHeader::new(MessageId::FunctionCall, MessageType::Request, 0)
            .encode(&mut buf)
            .unwrap();
        MessageHeader::patch_size(&mut buf, base).unwrap();
        buf
    }

    fn answer_frame(request_id: u32) -> (MessageHeader, FlatBuffer) {
        let mut buf = FlatBuffer::new();
        let header = MessageHeader::new(MessageId::Success, MessageType::Answer, request_id);
        let base = header.encode(&mut buf).unwrap();
        MessageHeader::patch_size(&mut buf, base).unwrap();

        (MessageHeader::decode(&buf, 0).unwrap(), buf)
    }

    #[tokio::test]
    async fn answers_correlate_fifo() {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new(pending.clone());

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let mut frame1 = request_frame();
        let mut frame2 = request_frame();
        let id1 = correlator
            .register(&mut frame1, tx1, DEFAULT_CALL_TIMEOUT)
            .unwrap();
        let id2 = correlator
            .register(&mut frame2, tx2, DEFAULT_CALL_TIMEOUT)
            .unwrap();

        assert_ne!(id1, 0);
        assert_eq!(pending.load(Ordering::Relaxed), 2);

        // The stamped id is readable back out of the frame.
        assert_eq!(flat::get::<u32>(&frame1, 8).unwrap(), id1);

        let (header1, answer1) = answer_frame(id1);
        correlator.complete(&header1, answer1);
        let (header2, answer2) = answer_frame(id2);
        correlator.complete(&header2, answer2);

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(pending.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn mismatched_answer_is_a_protocol_error() {
        let mut correlator = Correlator::new(Arc::new(AtomicUsize::new(0)));

        let (tx, rx) = oneshot::channel();
        let mut frame = request_frame();
        let id = correlator
            .register(&mut frame, tx, DEFAULT_CALL_TIMEOUT)
            .unwrap();

        let (header, answer) = answer_frame(id + 1);
        correlator.complete(&header, answer);

        assert!(matches!(rx.await.unwrap(), Err(Error::Protocol)));
    }

    #[tokio::test]
    async fn expired_head_frees_its_slot() {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new(pending.clone());

        let (tx, rx) = oneshot::channel();
        let mut frame = request_frame();
        correlator
            .register(&mut frame, tx, Duration::from_millis(1))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(correlator.expire_head(Instant::now()));
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(pending.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn teardown_aborts_everything() {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new(pending.clone());

        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                let mut frame = request_frame();
                correlator
                    .register(&mut frame, tx, DEFAULT_CALL_TIMEOUT)
                    .unwrap();
                rx
            })
            .collect();

        correlator.abort_all();
        assert_eq!(pending.load(Ordering::Relaxed), 0);

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(Error::OperationAborted)));
        }
    }

    #[test]
    fn submit_limits_enforced() {
        let (sender, _receiver) = session_queue(EndPoint::tcp(Ipv4Addr::LOCALHOST, 1));

        // Fill the write queue with oneways; the next submit must fail
        // instead of blocking.
        for _ in 0..MAX_WRITE_QUEUE {
            sender.submit(Work::Oneway { buf: request_frame() }).unwrap();
        }

        assert!(matches!(
            sender.submit(Work::Oneway { buf: request_frame() }),
            Err(Error::BufferFull)
        ));

        sender.close();
        assert!(matches!(
            sender.submit(Work::Oneway { buf: request_frame() }),
            Err(Error::CommFailure)
        ));
    }
}
