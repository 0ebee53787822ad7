//! The session driver.
//!
//! One driver task per connection, client or server side alike. It owns
//! the transport and is the session's strand: outbound work leaves in
//! enqueue order, inbound requests dispatch sequentially, and answers
//! correlate FIFO against the pending ledger. Stream frames carry their
//! own correlation (the stream id) and are routed to the session's stream
//! manager as they arrive, without disturbing the request queue.

use crate::rpc::Dispatcher;

use std::{io, sync::Arc};

use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    header::{MessageHeader, MessageId, MessageType},
};
use service::{
    ReferenceList,
    session::{Correlator, SessionReceiver, Work},
    stream::StreamManager,
};
use tokio::time::Instant;

/// How a concrete wire plugs into the driver. `recv` must be
/// cancel-safe: the driver drops an in-flight recv whenever outbound work
/// arrives, so partial frames have to survive inside the transport.
pub trait FrameTransport: Send {
    /// Next complete frame, `None` once the peer is gone for good.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<FlatBuffer>>> + Send;

    /// Write one complete frame.
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

pub struct SessionParams {
    pub remote: EndPoint,
    pub kind: TransportKind,
    pub ssl: bool,
}

enum Next {
    Outbound(Option<Work>),
    Inbound(io::Result<Option<FlatBuffer>>),
    HeadTimeout,
}

/// Run one session to completion. `handle` is the submit side of the
/// same session, handed to servants so they can open stream writers and
/// call back over tethered references.
pub async fn drive<T: FrameTransport>(
    mut transport: T,
    mut receiver: SessionReceiver,
    handle: Arc<dyn service::SessionHandle>,
    dispatcher: Arc<Dispatcher>,
    streams: Arc<StreamManager>,
    refs: Arc<ReferenceList>,
    params: SessionParams,
) {
    let mut correlator = Correlator::new(receiver.pending_counter());

    loop {
        let next = {
            let deadline = correlator.head_deadline();
            let timer = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let recv = transport.recv();
            tokio::pin!(recv);

            tokio::select! {
                frame = &mut recv => Next::Inbound(frame),
                work = receiver.queue.recv() => Next::Outbound(work),
                _ = timer => Next::HeadTimeout,
            }
        };

        match next {
            Next::Outbound(None) => break,
            Next::Outbound(Some(work)) => match work {
                Work::Request {
                    mut buf,
                    reply,
                    timeout,
                } => {
                    let request_id = match correlator.register(&mut buf, reply, timeout) {
                        Ok(request_id) => request_id,
                        Err(_) => continue,
                    };

                    if let Err(err) = transport.send(buf.data()).await {
                        log::warn!(
                            "session send failed: remote={}, err={}",
                            params.remote,
                            err
                        );
                        correlator.fail_tail(request_id, service::Error::CommFailure);
                        break;
                    }
                }
                Work::Oneway { buf } | Work::Stream { buf } => {
                    if let Err(err) = transport.send(buf.data()).await {
                        log::warn!(
                            "session send failed: remote={}, err={}",
                            params.remote,
                            err
                        );
                        break;
                    }
                }
                Work::Close => {
                    log::debug!("session closed locally: remote={}", params.remote);
                    break;
                }
            },
            Next::Inbound(Ok(Some(frame))) => {
                if let Some(reply) = handle_frame(
                    frame,
                    &handle,
                    &dispatcher,
                    &streams,
                    &refs,
                    &mut correlator,
                    &params,
                ) && let Err(err) = transport.send(reply.data()).await
                {
                    log::warn!(
                        "session reply send failed: remote={}, err={}",
                        params.remote,
                        err
                    );
                    break;
                }
            }
            Next::Inbound(Ok(None)) => {
                log::info!("session closed by peer: remote={}", params.remote);
                break;
            }
            Next::Inbound(Err(err)) => {
                log::warn!("session read failed: remote={}, err={}", params.remote, err);
                break;
            }
            Next::HeadTimeout => {
                correlator.expire_head(Instant::now());
            }
        }
    }

    // Teardown is idempotent: fail outstanding work, cancel streams,
    // release every object tethered to this session.
    receiver.mark_closed();
    receiver.queue.close();
    while let Ok(work) = receiver.queue.try_recv() {
        work.fail(service::Error::OperationAborted);
    }

    correlator.abort_all();
    streams.abort_all();
    dispatcher.release_session(&refs);

    log::debug!("session torn down: remote={}", params.remote);
}

/// Route one inbound frame; a returned buffer is the reply to write.
fn handle_frame(
    frame: FlatBuffer,
    handle: &Arc<dyn service::SessionHandle>,
    dispatcher: &Arc<Dispatcher>,
    streams: &Arc<StreamManager>,
    refs: &Arc<ReferenceList>,
    correlator: &mut Correlator,
    params: &SessionParams,
) -> Option<FlatBuffer> {
    let header = match MessageHeader::decode(&frame, 0) {
        Ok(header) => header,
        Err(err) => {
            log::warn!("bad frame dropped: remote={}, err={}", params.remote, err);
            return None;
        }
    };

    if header.msg_id.is_stream() {
        if let Err(err) = streams.route(frame) {
            log::warn!(
                "stream frame dropped: remote={}, err={}",
                params.remote,
                err
            );
        }
        return None;
    }

    match header.msg_type {
        MessageType::Request => match header.msg_id {
            MessageId::FunctionCall => dispatcher.dispatch_frame(
                frame,
                &params.remote,
                refs,
                Some(streams.clone()),
                Some(handle.clone()),
                params.kind,
                params.ssl,
            ),
            MessageId::ReleaseObject => {
                dispatcher.release_frame(&frame, refs);
                None
            }
            other => {
                log::warn!(
                    "unexpected request dropped: remote={}, msg_id={:?}",
                    params.remote,
                    other
                );
                None
            }
        },
        MessageType::Answer => {
            correlator.complete(&header, frame);
            None
        }
    }
}
