//! Proxies and servants.
//!
//! A proxy is a concrete value holding an [`ObjectId`] plus a handle to
//! the session that reaches its process; generated stubs wrap it and add
//! typed methods. A servant is a trait object pinned into a POA slot whose
//! generated `dispatch` switches on the function index.

use crate::{
    Error, UserException,
    context::SessionContext,
    session::{DEFAULT_CALL_TIMEOUT, Work},
};

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use codec::{
    FlatBuffer, flat,
    header::{CALL_HEADER_SIZE, CallHeader, MESSAGE_HEADER_SIZE, MessageHeader, MessageId, MessageType},
    oid::ObjectId,
};

use tokio::sync::oneshot;

/// Where call arguments start inside a request frame.
pub const REQUEST_PAYLOAD_OFFSET: usize = MESSAGE_HEADER_SIZE + CALL_HEADER_SIZE;

/// Where outputs (or an exception payload) start inside an answer frame.
pub const REPLY_PAYLOAD_OFFSET: usize = MESSAGE_HEADER_SIZE;

/// The way a proxy reaches its peer. Implemented by every transport
/// session; submission is synchronous enqueue, completion arrives through
/// the oneshot carried inside the [`Work`].
pub trait SessionHandle: Send + Sync {
    fn submit(&self, work: Work) -> Result<(), Error>;

    fn remote_endpoint(&self) -> &codec::endpoint::EndPoint;

    fn is_open(&self) -> bool {
        true
    }

    /// Stop accepting work; outstanding work fails as the session winds
    /// down.
    fn close(&self) {}
}

/// The server-side implementation instance.
///
/// `dispatch` reads arguments from `ctx.rx` starting at
/// [`REQUEST_PAYLOAD_OFFSET`], runs the implementation, and writes a
/// complete reply frame into `ctx.tx` (the [`begin_reply`] /
/// [`commit_reply`] pair stamps the header). `from_parent` is set when the
/// call was routed through a base interface of a derived servant.
pub trait ObjectServant: Send + Sync {
    fn class_id(&self) -> &'static str;

    /// Number of interfaces this servant exposes; function indices are
    /// scoped per interface.
    fn interface_count(&self) -> u8 {
        1
    }

    fn dispatch(&self, ctx: &mut SessionContext, from_parent: bool) -> Result<(), Error>;
}

/// Client-side stand-in for a remote servant.
///
/// Dropping the last handle emits a fire-and-forget `ReleaseObject` to the
/// owning process so it can drop the session reference.
pub struct Object {
    id: ObjectId,
    session: Arc<dyn SessionHandle>,
    timeout_ms: AtomicU64,
}

impl Object {
    pub fn new(id: ObjectId, session: Arc<dyn SessionHandle>) -> Self {
        Self {
            id,
            session,
            timeout_ms: AtomicU64::new(DEFAULT_CALL_TIMEOUT.as_millis() as u64),
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.id
    }

    pub fn session(&self) -> &Arc<dyn SessionHandle> {
        &self.session
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn encode_request(
        &self,
        interface_idx: u8,
        function_idx: u8,
        marshal: impl FnOnce(&mut FlatBuffer) -> Result<(), Error>,
    ) -> Result<FlatBuffer, Error> {
        let mut buf = FlatBuffer::new();

        // The session driver stamps the request id just before the frame
        // hits the wire; zero marks fire-and-forget.
        let base =
            MessageHeader::new(MessageId::FunctionCall, MessageType::Request, 0).encode(&mut buf)?;

        CallHeader {
            object_id: self.id.object_id,
            poa_idx: self.id.poa_idx,
            interface_idx,
            function_idx,
        }
        .encode(&mut buf)?;

        marshal(&mut buf)?;
        MessageHeader::patch_size(&mut buf, base)?;

        Ok(buf)
    }

    /// Issue a call and wait for the correlated answer. The returned
    /// buffer holds the whole answer frame; outputs start at
    /// [`REPLY_PAYLOAD_OFFSET`].
    pub async fn invoke(
        &self,
        interface_idx: u8,
        function_idx: u8,
        marshal: impl FnOnce(&mut FlatBuffer) -> Result<(), Error>,
    ) -> Result<FlatBuffer, Error> {
        let buf = self.encode_request(interface_idx, function_idx, marshal)?;

        let (reply, completion) = oneshot::channel();
        self.session.submit(Work::Request {
            buf,
            reply,
            timeout: self.timeout(),
        })?;

        let answer = completion.await.map_err(|_| Error::CommFailure)??;
        classify_reply(&answer)?;

        Ok(answer)
    }

    /// Issue a call without waiting for (or expecting) an answer.
    pub fn invoke_oneway(
        &self,
        interface_idx: u8,
        function_idx: u8,
        marshal: impl FnOnce(&mut FlatBuffer) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let buf = self.encode_request(interface_idx, function_idx, marshal)?;
        self.session.submit(Work::Oneway { buf })
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if !self.session.is_open() {
            return;
        }

        let mut buf = FlatBuffer::new();
        let frame = (|| -> Result<(), Error> {
            let base = MessageHeader::new(MessageId::ReleaseObject, MessageType::Request, 0)
                .encode(&mut buf)?;
            CallHeader {
                object_id: self.id.object_id,
                poa_idx: self.id.poa_idx,
                interface_idx: self.id.interface_idx,
                function_idx: 0,
            }
            .encode(&mut buf)?;
            Ok(MessageHeader::patch_size(&mut buf, base)?)
        })();

        if frame.is_ok() {
            // Best effort; a dead session already released everything.
            let _ = self.session.submit(Work::Oneway { buf });
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("remote", self.session.remote_endpoint())
            .finish()
    }
}

/// Start a reply frame in `ctx.tx`, echoing the request id. Returns the
/// frame base for [`commit_reply`].
pub fn begin_reply(ctx: &mut SessionContext, msg_id: MessageId) -> Result<usize, Error> {
    let request_id = ctx.request_id;
    Ok(MessageHeader::new(msg_id, MessageType::Answer, request_id).encode(&mut ctx.tx)?)
}

/// Stamp the size of a reply started with [`begin_reply`].
pub fn commit_reply(ctx: &mut SessionContext, base: usize) -> Result<(), Error> {
    Ok(MessageHeader::patch_size(&mut ctx.tx, base)?)
}

/// Build a complete error answer into `tx`.
pub fn write_error_reply(tx: &mut FlatBuffer, request_id: u32, error: &Error) -> Result<(), Error> {
    let msg_id = match error {
        Error::UnknownObject => MessageId::ErrorObjectNotExist,
        Error::UnknownFunction => MessageId::ErrorUnknownFunction,
        Error::BadFrame | Error::Marshal(_) => MessageId::ErrorBadFrame,
        Error::MessageTooLarge => MessageId::ErrorMessageTooLarge,
        Error::BufferFull => MessageId::ErrorBufferFull,
        Error::UserException(_) => MessageId::ErrorUserException,
        _ => MessageId::ErrorProtocol,
    };

    let base = MessageHeader::new(msg_id, MessageType::Answer, request_id).encode(tx)?;

    if let Error::UserException(exception) = error {
        let block = flat::reserve_struct(tx, 16)?;
        flat::alloc_str(tx, block, &exception.class_id)?;
        flat::alloc_bytes(tx, block + 8, &exception.payload)?;
    }

    Ok(MessageHeader::patch_size(tx, base)?)
}

/// Map an answer frame to the caller's result: `Ok` for success replies,
/// the decoded error kind otherwise.
pub fn classify_reply(buf: &FlatBuffer) -> Result<(), Error> {
    let header = MessageHeader::decode(buf, 0)?;

    match header.msg_id {
        MessageId::Success | MessageId::BlockResponse => Ok(()),
        MessageId::ErrorObjectNotExist => Err(Error::UnknownObject),
        MessageId::ErrorUnknownFunction => Err(Error::UnknownFunction),
        MessageId::ErrorBadFrame => Err(Error::BadFrame),
        MessageId::ErrorMessageTooLarge => Err(Error::MessageTooLarge),
        MessageId::ErrorBufferFull => Err(Error::BufferFull),
        MessageId::ErrorUserException => {
            let block = REPLY_PAYLOAD_OFFSET;
            Err(Error::UserException(UserException {
                class_id: flat::get_str(buf, block)?.to_string(),
                payload: flat::get_bytes(buf, block + 8)?.to_vec(),
            }))
        }
        MessageId::ErrorProtocol => Err(Error::Protocol),
        _ => Err(Error::Protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReferenceList;
    use codec::endpoint::EndPoint;
    use std::net::Ipv4Addr;

    fn context() -> SessionContext {
        SessionContext::new(
            EndPoint::tcp(Ipv4Addr::LOCALHOST, 15000),
            ReferenceList::new(),
        )
    }

    #[test]
    fn reply_roundtrip() {
        let mut ctx = context();
        ctx.request_id = 11;

        let base = begin_reply(&mut ctx, MessageId::BlockResponse).unwrap();
        flat::reserve_struct(&mut ctx.tx, 8).unwrap();
        flat::put(&mut ctx.tx, REPLY_PAYLOAD_OFFSET, 1234u64).unwrap();
        commit_reply(&mut ctx, base).unwrap();

        let header = MessageHeader::decode(&ctx.tx, 0).unwrap();
        assert_eq!(header.request_id, 11);
        assert_eq!(header.size as usize, MESSAGE_HEADER_SIZE + 8 - 4);

        classify_reply(&ctx.tx).unwrap();
        assert_eq!(
            flat::get::<u64>(&ctx.tx, REPLY_PAYLOAD_OFFSET).unwrap(),
            1234
        );
    }

    #[test]
    fn user_exception_travels_as_a_value() {
        let mut tx = FlatBuffer::new();
        let exception = UserException {
            class_id: "demo/overflow".to_string(),
            payload: vec![1, 2, 3],
        };

        write_error_reply(&mut tx, 5, &Error::UserException(exception.clone())).unwrap();

        match classify_reply(&tx) {
            Err(Error::UserException(decoded)) => assert_eq!(decoded, exception),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn error_kinds_map_to_wire_ids() {
        for (error, expected) in [
            (Error::UnknownObject, MessageId::ErrorObjectNotExist),
            (Error::UnknownFunction, MessageId::ErrorUnknownFunction),
            (Error::BadFrame, MessageId::ErrorBadFrame),
            (Error::MessageTooLarge, MessageId::ErrorMessageTooLarge),
            (Error::BufferFull, MessageId::ErrorBufferFull),
            (Error::Protocol, MessageId::ErrorProtocol),
        ] {
            let mut tx = FlatBuffer::new();
            write_error_reply(&mut tx, 1, &error).unwrap();
            assert_eq!(MessageHeader::decode(&tx, 0).unwrap().msg_id, expected);
        }
    }
}
