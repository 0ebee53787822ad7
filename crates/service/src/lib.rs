//! ## Object core
//!
//! The server half of flatwire: the generation-tagged reference table, the
//! portable object adapter that issues object ids, the proxy/servant
//! traits that generated stubs build on, the transport-agnostic session
//! state, and the stream manager.

pub mod context;
pub mod object;
pub mod poa;
pub mod session;
pub mod stream;
pub mod table;

pub use self::{
    context::{ReferenceList, SessionContext, SessionRef},
    object::{Object, ObjectServant, SessionHandle},
    poa::{IdPolicy, Lifespan, Poa, PoaBuilder},
    table::IdTable,
};

/// A user-defined exception carried through the wire as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserException {
    pub class_id: String,
    pub payload: Vec<u8>,
}

/// The error taxonomy the core produces. The `Error*` message ids on the
/// wire map onto these one-to-one; `CommFailure`, `Timeout`,
/// `OperationAborted` and `Policy` are local conditions that never travel.
#[derive(Debug)]
pub enum Error {
    /// Transport gone and reconnect exhausted.
    CommFailure,
    Timeout,
    MessageTooLarge,
    /// Truncated frame or size fields that do not add up.
    BadFrame,
    /// No servant for `(poa_idx, object_id)`.
    UnknownObject,
    UnknownFunction,
    /// Unexpected message at this point in the state machine.
    Protocol,
    UserException(UserException),
    /// A queue or ring refused the submission.
    BufferFull,
    /// The session went down with this work outstanding.
    OperationAborted,
    /// POA policy violation (wrong activation path, id out of range).
    Policy,
    Marshal(codec::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Marshal(value)
    }
}
