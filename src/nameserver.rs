//! Nameserver interface.
//!
//! The nameserver is an ordinary RPC object — the core has no special
//! resolution path. This module is the hand-written equivalent of what
//! the stub generator emits for it: a typed proxy over [`Object`] and a
//! servant base whose `dispatch` switches on the function index — plus
//! the in-memory implementation the daemon binary hosts.
//!
//! Interface 0:
//!
//! | fn | name | in | out |
//! |---|---|---|---|
//! | 0 | `Bind` | `{object: ObjectId, name: string}` | — |
//! | 1 | `Resolve` | `{name: string}` | `{found: bool, object: ObjectId}` |

use crate::rpc::Rpc;

use std::net::Ipv4Addr;

use ahash::{HashMap, HashMapExt};
use codec::{
    endpoint::EndPoint,
    flat,
    header::MessageId,
    oid::{self, OBJECT_ID_SIZE, ObjectId},
};
use parking_lot::Mutex;
use service::{
    Error, Object, ObjectServant, SessionContext,
    object::{REPLY_PAYLOAD_OFFSET, REQUEST_PAYLOAD_OFFSET, begin_reply, commit_reply},
};

pub const NAMESERVER_CLASS_ID: &str = "flatwire/nameserver";

/// The nameserver always activates under this well-known id on POA 0.
pub const NAMESERVER_OBJECT_ID: u64 = 0;

/// The reference every client uses to reach a nameserver at `endpoint`.
pub fn nameserver_object_id(endpoint: EndPoint) -> ObjectId {
    ObjectId {
        object_id: NAMESERVER_OBJECT_ID,
        poa_idx: 0,
        flags: oid::flags::HAS_CLASS_ID,
        interface_idx: 0,
        class_id: NAMESERVER_CLASS_ID.to_string(),
        hostname: match &endpoint.host {
            codec::endpoint::HostId::Socket { ip, .. } => ip.to_string(),
            codec::endpoint::HostId::Channel(id) => id.clone(),
        },
        endpoint,
    }
}

/// Typed client proxy.
pub struct Nameserver {
    object: Object,
}

impl Nameserver {
    pub fn new(object: Object) -> Self {
        Self { object }
    }

    /// Connect to a nameserver endpoint through `rpc`.
    pub async fn connect(rpc: &Rpc, endpoint: &EndPoint) -> Result<Self, Error> {
        Ok(Self::new(
            rpc.object(&nameserver_object_id(endpoint.clone())).await?,
        ))
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub async fn bind(&self, id: &ObjectId, name: &str) -> Result<(), Error> {
        self.object
            .invoke(0, 0, |buf| {
                let base = flat::reserve_struct(buf, OBJECT_ID_SIZE + 8)?;
                id.encode_into(buf, base)?;
                flat::alloc_str(buf, base + OBJECT_ID_SIZE, name)?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    pub async fn resolve(&self, name: &str) -> Result<Option<ObjectId>, Error> {
        let reply = self
            .object
            .invoke(0, 1, |buf| {
                let base = flat::reserve_struct(buf, 8)?;
                flat::alloc_str(buf, base, name)?;
                Ok(())
            })
            .await?;

        let base = REPLY_PAYLOAD_OFFSET;
        if flat::get::<u8>(&reply, base)? == 0 {
            return Ok(None);
        }

        Ok(Some(ObjectId::decode(&reply, base + 4)?))
    }
}

/// In-memory name table; persistence belongs to somebody else.
#[derive(Default)]
pub struct NameserverServant {
    entries: Mutex<HashMap<String, ObjectId>>,
}

impl NameserverServant {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(64)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ObjectServant for NameserverServant {
    fn class_id(&self) -> &'static str {
        NAMESERVER_CLASS_ID
    }

    fn dispatch(&self, ctx: &mut SessionContext, _from_parent: bool) -> Result<(), Error> {
        match ctx.call.function_idx {
            // Bind
            0 => {
                let id = ObjectId::decode(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?;
                let name = flat::get_str(&ctx.rx, REQUEST_PAYLOAD_OFFSET + OBJECT_ID_SIZE)?
                    .to_string();

                log::info!("nameserver bind: name={}, oid=({}, {})", name, id.poa_idx, id.object_id);
                self.entries.lock().insert(name, id);

                let base = begin_reply(ctx, MessageId::Success)?;
                commit_reply(ctx, base)
            }
            // Resolve
            1 => {
                let entry = {
                    let name = flat::get_str(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?;
                    self.entries.lock().get(name).cloned()
                };

                let base = begin_reply(ctx, MessageId::BlockResponse)?;
                let block = flat::reserve_struct(&mut ctx.tx, 4 + OBJECT_ID_SIZE)?;

                if let Some(id) = entry {
                    flat::put(&mut ctx.tx, block, 1u8)?;
                    id.encode_into(&mut ctx.tx, block + 4)?;
                }

                commit_reply(ctx, base)
            }
            _ => Err(Error::UnknownFunction),
        }
    }
}

/// Endpoint helper for clients configured with a plain host/port pair.
pub fn default_endpoint(ip: Ipv4Addr, port: u16) -> EndPoint {
    EndPoint::tcp(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::FlatBuffer;
    use codec::header::{CallHeader, MESSAGE_HEADER_SIZE, MessageHeader, MessageType};
    use service::ReferenceList;

    fn call_frame(function_idx: u8, marshal: impl FnOnce(&mut FlatBuffer)) -> FlatBuffer {
        let mut buf = FlatBuffer::new();
        let base = MessageHeader::new(MessageId::FunctionCall, MessageType::Request, 1)
            .encode(&mut buf)
            .unwrap();
        CallHeader {
            object_id: NAMESERVER_OBJECT_ID,
            poa_idx: 0,
            interface_idx: 0,
            function_idx,
        }
        .encode(&mut buf)
        .unwrap();
        marshal(&mut buf);
        MessageHeader::patch_size(&mut buf, base).unwrap();
        buf
    }

    fn dispatch(servant: &NameserverServant, rx: FlatBuffer) -> SessionContext {
        let mut ctx = SessionContext::new(
            EndPoint::tcp(Ipv4Addr::LOCALHOST, 9),
            ReferenceList::new(),
        );
        ctx.rx = rx;
        ctx.request_id = 1;
        ctx.call = CallHeader::decode(&ctx.rx, MESSAGE_HEADER_SIZE).unwrap();
        servant.dispatch(&mut ctx, false).unwrap();
        ctx
    }

    #[test]
    fn bind_then_resolve() {
        let servant = NameserverServant::new();
        let id = nameserver_object_id(EndPoint::tcp(Ipv4Addr::LOCALHOST, 15000));

        let bind = call_frame(0, |buf| {
            let base = flat::reserve_struct(buf, OBJECT_ID_SIZE + 8).unwrap();
            id.encode_into(buf, base).unwrap();
            flat::alloc_str(buf, base + OBJECT_ID_SIZE, "ns").unwrap();
        });
        let ctx = dispatch(&servant, bind);
        assert_eq!(
            MessageHeader::decode(&ctx.tx, 0).unwrap().msg_id,
            MessageId::Success
        );
        assert_eq!(servant.len(), 1);

        let resolve = call_frame(1, |buf| {
            let base = flat::reserve_struct(buf, 8).unwrap();
            flat::alloc_str(buf, base, "ns").unwrap();
        });
        let ctx = dispatch(&servant, resolve);

        assert_eq!(flat::get::<u8>(&ctx.tx, REPLY_PAYLOAD_OFFSET).unwrap(), 1);
        let resolved = ObjectId::decode(&ctx.tx, REPLY_PAYLOAD_OFFSET + 4).unwrap();
        assert_eq!(resolved, id);
    }

    #[test]
    fn resolve_miss_reports_not_found() {
        let servant = NameserverServant::new();

        let resolve = call_frame(1, |buf| {
            let base = flat::reserve_struct(buf, 8).unwrap();
            flat::alloc_str(buf, base, "nobody").unwrap();
        });
        let ctx = dispatch(&servant, resolve);

        assert_eq!(flat::get::<u8>(&ctx.tx, REPLY_PAYLOAD_OFFSET).unwrap(), 0);
    }

    #[test]
    fn unknown_function_rejected() {
        let servant = NameserverServant::new();
        let frame = call_frame(9, |_| {});

        let mut ctx = SessionContext::new(
            EndPoint::tcp(Ipv4Addr::LOCALHOST, 9),
            ReferenceList::new(),
        );
        ctx.call = CallHeader::decode(&frame, MESSAGE_HEADER_SIZE).unwrap();
        ctx.rx = frame;

        assert!(matches!(
            servant.dispatch(&mut ctx, false),
            Err(Error::UnknownFunction)
        ));
    }
}
