//! Sample interfaces, written the way the stub generator emits them.
//!
//! Each module is one IDL interface: a typed proxy wrapping
//! [`service::Object`] with one method per operation, and a servant base
//! whose `dispatch` switches on the function index. Real projects get
//! these from codegen; this crate keeps a hand-written set around as the
//! reference shape and as the substrate for the end-to-end tests.

pub mod echo {
    use codec::{flat, header::MessageId};
    use service::{
        Error, Object, ObjectServant, SessionContext, UserException,
        object::{REPLY_PAYLOAD_OFFSET, REQUEST_PAYLOAD_OFFSET, begin_reply, commit_reply},
    };

    pub const CLASS_ID: &str = "flatwire.demo/echo";
    pub const INTERFACE_IDX: u8 = 0;

    pub mod fns {
        pub const ECHO: u8 = 0;
        pub const COUNT_ONES: u8 = 1;
        pub const FAIL_WITH: u8 = 2;
    }

    pub struct Echo {
        object: Object,
    }

    impl Echo {
        pub fn new(object: Object) -> Self {
            Self { object }
        }

        pub fn object(&self) -> &Object {
            &self.object
        }

        pub async fn echo(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
            let reply = self
                .object
                .invoke(INTERFACE_IDX, fns::ECHO, |buf| {
                    let base = flat::reserve_struct(buf, 8)?;
                    flat::alloc_bytes(buf, base, data)?;
                    Ok(())
                })
                .await?;

            Ok(flat::get_bytes(&reply, REPLY_PAYLOAD_OFFSET)?.to_vec())
        }

        pub async fn count_ones(&self, data: &[u8]) -> Result<u32, Error> {
            let reply = self
                .object
                .invoke(INTERFACE_IDX, fns::COUNT_ONES, |buf| {
                    let base = flat::reserve_struct(buf, 8)?;
                    flat::alloc_bytes(buf, base, data)?;
                    Ok(())
                })
                .await?;

            Ok(flat::get(&reply, REPLY_PAYLOAD_OFFSET)?)
        }

        pub async fn fail_with(&self, code: u32, message: &str) -> Result<(), Error> {
            self.object
                .invoke(INTERFACE_IDX, fns::FAIL_WITH, |buf| {
                    let base = flat::reserve_struct(buf, 12)?;
                    flat::put(buf, base, code)?;
                    flat::alloc_str(buf, base + 4, message)?;
                    Ok(())
                })
                .await?;

            Ok(())
        }
    }

    pub trait EchoImpl: Send + Sync {
        fn echo(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
        fn count_ones(&self, data: &[u8]) -> Result<u32, Error>;
        fn fail_with(&self, code: u32, message: &str) -> Result<(), Error>;
    }

    pub struct EchoServant<T: EchoImpl>(pub T);

    impl<T: EchoImpl + 'static> ObjectServant for EchoServant<T> {
        fn class_id(&self) -> &'static str {
            CLASS_ID
        }

        fn dispatch(&self, ctx: &mut SessionContext, _from_parent: bool) -> Result<(), Error> {
            match ctx.call.function_idx {
                fns::ECHO => {
                    let result = self.0.echo(flat::get_bytes(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?)?;

                    let base = begin_reply(ctx, MessageId::BlockResponse)?;
                    let block = flat::reserve_struct(&mut ctx.tx, 8)?;
                    flat::alloc_bytes(&mut ctx.tx, block, &result)?;
                    commit_reply(ctx, base)
                }
                fns::COUNT_ONES => {
                    let value =
                        self.0.count_ones(flat::get_bytes(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?)?;

                    let base = begin_reply(ctx, MessageId::BlockResponse)?;
                    let block = flat::reserve_struct(&mut ctx.tx, 4)?;
                    flat::put(&mut ctx.tx, block, value)?;
                    commit_reply(ctx, base)
                }
                fns::FAIL_WITH => {
                    let code = flat::get(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?;
                    let message = flat::get_str(&ctx.rx, REQUEST_PAYLOAD_OFFSET + 4)?.to_string();

                    self.0.fail_with(code, &message)?;

                    let base = begin_reply(ctx, MessageId::Success)?;
                    commit_reply(ctx, base)
                }
                _ => Err(Error::UnknownFunction),
            }
        }
    }

    /// The reference implementation used by the scenario tests.
    #[derive(Clone, Default)]
    pub struct Mirror;

    impl EchoImpl for Mirror {
        fn echo(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(data.to_vec())
        }

        fn count_ones(&self, data: &[u8]) -> Result<u32, Error> {
            Ok(data.iter().map(|byte| byte.count_ones()).sum())
        }

        fn fail_with(&self, code: u32, message: &str) -> Result<(), Error> {
            Err(Error::UserException(UserException {
                class_id: "flatwire.demo/mirror-error".to_string(),
                payload: {
                    let mut payload = code.to_le_bytes().to_vec();
                    payload.extend_from_slice(message.as_bytes());
                    payload
                },
            }))
        }
    }
}

pub mod bytestream {
    use codec::{flat, header::MessageId};
    use service::{
        Error, Object, ObjectServant, SessionContext,
        object::{REPLY_PAYLOAD_OFFSET, REQUEST_PAYLOAD_OFFSET, begin_reply, commit_reply},
    };

    pub const CLASS_ID: &str = "flatwire.demo/bytestream";
    pub const INTERFACE_IDX: u8 = 0;

    pub mod fns {
        pub const GET_BYTE_STREAM: u8 = 0;
    }

    pub struct ByteStream {
        object: Object,
    }

    impl ByteStream {
        pub fn new(object: Object) -> Self {
            Self { object }
        }

        /// Ask the servant to stream `size` one-byte chunks; returns the
        /// stream id to attach a reader to.
        pub async fn get_byte_stream(&self, size: u32) -> Result<u32, Error> {
            let reply = self
                .object
                .invoke(INTERFACE_IDX, fns::GET_BYTE_STREAM, |buf| {
                    let base = flat::reserve_struct(buf, 4)?;
                    flat::put(buf, base, size)?;
                    Ok(())
                })
                .await?;

            Ok(flat::get(&reply, REPLY_PAYLOAD_OFFSET)?)
        }
    }

    /// Streams the byte sequence `0, 1, 2, …` as one-byte chunks.
    #[derive(Default)]
    pub struct ByteStreamServant;

    impl ObjectServant for ByteStreamServant {
        fn class_id(&self) -> &'static str {
            CLASS_ID
        }

        fn dispatch(&self, ctx: &mut SessionContext, _from_parent: bool) -> Result<(), Error> {
            match ctx.call.function_idx {
                fns::GET_BYTE_STREAM => {
                    let size: u32 = flat::get(&ctx.rx, REQUEST_PAYLOAD_OFFSET)?;

                    let streams = ctx.streams.clone().ok_or(Error::Protocol)?;
                    let session = ctx.session.clone().ok_or(Error::Protocol)?;
                    let mut writer = streams.open_writer(session)?;
                    let stream_id = writer.stream_id();

                    // The producer runs beside the session; window credit
                    // paces it against the consumer.
                    let handle =
                        tokio::runtime::Handle::try_current().map_err(|_| Error::Protocol)?;
                    handle.spawn(async move {
                        for index in 0..size {
                            if writer.send(&[index as u8]).await.is_err() {
                                return;
                            }
                        }

                        if let Err(err) = writer.finish() {
                            log::warn!("byte stream completion failed: err={}", err);
                        }
                    });

                    let base = begin_reply(ctx, MessageId::BlockResponse)?;
                    let block = flat::reserve_struct(&mut ctx.tx, 4)?;
                    flat::put(&mut ctx.tx, block, stream_id)?;
                    commit_reply(ctx, base)
                }
                _ => Err(Error::UnknownFunction),
            }
        }
    }
}

pub mod tracker {
    use codec::{flat, header::MessageId};
    use service::{
        Error, Object, ObjectServant, SessionContext,
        object::{REQUEST_PAYLOAD_OFFSET, begin_reply, commit_reply},
    };

    pub const CLASS_ID: &str = "flatwire.demo/tracker";
    pub const INTERFACE_IDX: u8 = 0;

    pub mod fns {
        pub const POSITION_UPDATE: u8 = 0;
    }

    pub struct Tracker {
        object: Object,
    }

    impl Tracker {
        pub fn new(object: Object) -> Self {
            Self { object }
        }

        /// Fire-and-forget; never blocks on the peer.
        pub fn position_update(&self, x: f32, y: f32, z: f32) -> Result<(), Error> {
            self.object
                .invoke_oneway(INTERFACE_IDX, fns::POSITION_UPDATE, |buf| {
                    let base = flat::reserve_struct(buf, 12)?;
                    flat::put(buf, base, x)?;
                    flat::put(buf, base + 4, y)?;
                    flat::put(buf, base + 8, z)?;
                    Ok(())
                })
        }
    }

    pub trait TrackerImpl: Send + Sync {
        fn position_update(&self, x: f32, y: f32, z: f32);
    }

    pub struct TrackerServant<T: TrackerImpl>(pub T);

    impl<T: TrackerImpl + 'static> ObjectServant for TrackerServant<T> {
        fn class_id(&self) -> &'static str {
            CLASS_ID
        }

        fn dispatch(&self, ctx: &mut SessionContext, _from_parent: bool) -> Result<(), Error> {
            match ctx.call.function_idx {
                fns::POSITION_UPDATE => {
                    let base = REQUEST_PAYLOAD_OFFSET;
                    self.0.position_update(
                        flat::get(&ctx.rx, base)?,
                        flat::get(&ctx.rx, base + 4)?,
                        flat::get(&ctx.rx, base + 8)?,
                    );

                    // Fire-and-forget callers never read this; reliable
                    // ones get a plain success.
                    let reply = begin_reply(ctx, MessageId::Success)?;
                    commit_reply(ctx, reply)
                }
                _ => Err(Error::UnknownFunction),
            }
        }
    }
}

pub mod factory {
    use std::sync::Arc;

    use codec::{
        endpoint::EndPoint,
        flat,
        header::MessageId,
        oid::{OBJECT_ID_SIZE, ObjectId},
    };
    use service::{
        Error, Object, ObjectServant, SessionContext, SessionRef,
        object::{REPLY_PAYLOAD_OFFSET, begin_reply, commit_reply},
        poa::{Poa, activation},
    };

    use crate::echo::{self, EchoImpl, EchoServant};

    pub const CLASS_ID: &str = "flatwire.demo/factory";
    pub const INTERFACE_IDX: u8 = 0;

    pub mod fns {
        pub const CREATE_ECHO: u8 = 0;
    }

    pub struct Factory {
        object: Object,
    }

    impl Factory {
        pub fn new(object: Object) -> Self {
            Self { object }
        }

        /// Activate a fresh echo servant on the server's transient POA
        /// and return its reference. The servant lives only as long as
        /// the calling session.
        pub async fn create_echo(&self) -> Result<ObjectId, Error> {
            let reply = self
                .object
                .invoke(INTERFACE_IDX, fns::CREATE_ECHO, |_| Ok(()))
                .await?;

            Ok(ObjectId::decode(&reply, REPLY_PAYLOAD_OFFSET)?)
        }
    }

    /// Mints transient echo servants into the POA it was built over.
    pub struct FactoryServant<T: EchoImpl + Clone> {
        pub poa: Arc<Poa>,
        pub endpoint: EndPoint,
        pub hostname: String,
        pub template: T,
    }

    impl<T: EchoImpl + Clone + 'static> ObjectServant for FactoryServant<T> {
        fn class_id(&self) -> &'static str {
            CLASS_ID
        }

        fn dispatch(&self, ctx: &mut SessionContext, _from_parent: bool) -> Result<(), Error> {
            match ctx.call.function_idx {
                fns::CREATE_ECHO => {
                    let servant = Arc::new(EchoServant(self.template.clone()));
                    let object_id = self.poa.activate(servant, activation::ALLOW_ALL)?;

                    // Tie the servant to the calling session; teardown
                    // releases it.
                    ctx.refs.add(SessionRef {
                        poa_idx: self.poa.index(),
                        object_id,
                    })?;

                    let id = self.poa.object_id(
                        object_id,
                        echo::CLASS_ID,
                        echo::INTERFACE_IDX,
                        &self.hostname,
                        self.endpoint.clone(),
                    );

                    let base = begin_reply(ctx, MessageId::BlockResponse)?;
                    flat::reserve_struct(&mut ctx.tx, OBJECT_ID_SIZE)?;
                    id.encode_into(&mut ctx.tx, REPLY_PAYLOAD_OFFSET)?;
                    commit_reply(ctx, base)
                }
                _ => Err(Error::UnknownFunction),
            }
        }
    }
}
