//! Per-dispatch and per-session server state.

use crate::{Error, object::SessionHandle, stream::StreamManager};

use std::sync::Arc;

use codec::{FlatBuffer, endpoint::EndPoint, header::CallHeader};

use parking_lot::Mutex;

/// Hard cap on object references a single session may accumulate.
pub const MAX_REFERENCES_PER_SESSION: usize = 10_000;

/// One object handed out over a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRef {
    pub poa_idx: u16,
    pub object_id: u64,
}

/// Every object reference that travelled over a session, so the process
/// can release them all when the session dies. Shared between the session
/// driver and dispatch code.
#[derive(Default)]
pub struct ReferenceList {
    refs: Mutex<Vec<SessionRef>>,
}

impl ReferenceList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a reference; fails once the per-session cap is reached.
    pub fn add(&self, entry: SessionRef) -> Result<(), Error> {
        let mut refs = self.refs.lock();
        if refs.contains(&entry) {
            return Ok(());
        }

        if refs.len() >= MAX_REFERENCES_PER_SESSION {
            return Err(Error::BufferFull);
        }

        refs.push(entry);
        Ok(())
    }

    /// Drop one reference, typically on a `ReleaseObject` frame.
    pub fn remove(&self, entry: &SessionRef) -> bool {
        let mut refs = self.refs.lock();
        match refs.iter().position(|r| r == entry) {
            Some(index) => {
                refs.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Take everything; used on session teardown. Idempotent.
    pub fn drain(&self) -> Vec<SessionRef> {
        std::mem::take(&mut *self.refs.lock())
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}

/// Everything a servant sees for the duration of one dispatch.
///
/// The rx/tx buffers belong to the transport and must not outlive the
/// dispatch; for shared memory they are views straight into ring storage.
pub struct SessionContext {
    pub remote_endpoint: EndPoint,
    pub refs: Arc<ReferenceList>,
    /// Incoming frame, readable from offset zero (message header first).
    pub rx: FlatBuffer,
    /// Reply frame under construction.
    pub tx: FlatBuffer,
    /// Routing block of the call being dispatched.
    pub call: CallHeader,
    pub request_id: u32,
    /// Stream manager of the session, when the transport supports
    /// streaming.
    pub streams: Option<Arc<StreamManager>>,
    /// Handle back onto the session the call arrived on; the only legal
    /// route to a tethered endpoint, and the wire for stream writers a
    /// servant opens.
    pub session: Option<Arc<dyn SessionHandle>>,
    /// Request cookies, HTTP transport only.
    pub cookies: Vec<(String, String)>,
    /// `Set-Cookie` values the servant wants appended to the response.
    pub set_cookies: Vec<String>,
}

impl SessionContext {
    pub fn new(remote_endpoint: EndPoint, refs: Arc<ReferenceList>) -> Self {
        Self {
            remote_endpoint,
            refs,
            rx: FlatBuffer::new(),
            tx: FlatBuffer::new(),
            call: CallHeader {
                object_id: 0,
                poa_idx: 0,
                interface_idx: 0,
                function_idx: 0,
            },
            request_id: 0,
            streams: None,
            session: None,
            cookies: Vec::new(),
            set_cookies: Vec::new(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}
