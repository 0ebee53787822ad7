//! Top-level coordinator.
//!
//! An [`Rpc`] value owns the POA registry, the listeners, and the client
//! session cache. There is no process-wide instance: everything threads
//! through this handle. The [`Dispatcher`] inside it is the single entry
//! point every ingress transport funnels request frames through.

use crate::{config::Config, transport};

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    header::{CallHeader, MESSAGE_HEADER_SIZE, MessageHeader, MessageId},
    oid::ObjectId,
};
use parking_lot::{Mutex, RwLock};
use service::{
    Error, Object, ObjectServant, ReferenceList, SessionContext, SessionHandle, SessionRef,
    poa::{Lifespan, Poa, PoaBuilder},
    object::write_error_reply,
    stream::{StreamManager, StreamReader},
};

/// Request routing shared by every ingress transport.
pub struct Dispatcher {
    poas: RwLock<Vec<Arc<Poa>>>,
    hostname: String,
    max_message_size: usize,
}

impl Dispatcher {
    fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            poas: RwLock::new(Vec::new()),
            hostname: config.hostname.clone(),
            max_message_size: config.max_message_size,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Finalise a POA under the next free index.
    pub fn create_poa(&self, builder: PoaBuilder) -> Result<Arc<Poa>, Error> {
        let mut poas = self.poas.write();
        if poas.len() > u16::MAX as usize {
            return Err(Error::BufferFull);
        }

        let poa = builder.build(poas.len() as u16);
        poas.push(poa.clone());

        Ok(poa)
    }

    pub fn poa(&self, index: u16) -> Option<Arc<Poa>> {
        self.poas.read().get(index as usize).cloned()
    }

    /// Dispatch a request frame with a transport-provided context shell.
    /// Returns the reply frame, or `None` for fire-and-forget requests.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_frame(
        &self,
        frame: FlatBuffer,
        remote: &EndPoint,
        refs: &Arc<ReferenceList>,
        streams: Option<Arc<StreamManager>>,
        session: Option<Arc<dyn SessionHandle>>,
        kind: TransportKind,
        ssl: bool,
    ) -> Option<FlatBuffer> {
        let mut ctx = SessionContext::new(remote.clone(), refs.clone());
        ctx.rx = frame;
        ctx.streams = streams;
        ctx.session = session;

        if self.dispatch_ctx(&mut ctx, kind, ssl) {
            Some(std::mem::take(&mut ctx.tx))
        } else {
            None
        }
    }

    /// Dispatch over a caller-prepared context (the http transport fills
    /// cookies first). Returns whether `ctx.tx` holds a reply to send.
    pub fn dispatch_ctx(&self, ctx: &mut SessionContext, kind: TransportKind, ssl: bool) -> bool {
        let header = match MessageHeader::decode(&ctx.rx, 0) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("undecodable frame dropped: err={}", err);
                return false;
            }
        };

        ctx.request_id = header.request_id;

        let result = match (
            header.msg_id,
            CallHeader::decode(&ctx.rx, MESSAGE_HEADER_SIZE),
        ) {
            (MessageId::FunctionCall, Ok(call)) => {
                ctx.call = call;
                self.invoke(ctx, kind, ssl)
            }
            (MessageId::FunctionCall, Err(_)) => Err(Error::BadFrame),
            (other, _) => {
                log::warn!("unexpected request message: msg_id={:?}", other);
                Err(Error::Protocol)
            }
        };

        if let Err(error) = result {
            log::debug!(
                "dispatch failed: remote={}, oid=({}, {}), err={}",
                ctx.remote_endpoint,
                ctx.call.poa_idx,
                ctx.call.object_id,
                error
            );

            ctx.tx.clear();
            if write_error_reply(&mut ctx.tx, header.request_id, &error).is_err() {
                return false;
            }
        }

        header.request_id != 0
    }

    fn invoke(&self, ctx: &mut SessionContext, kind: TransportKind, ssl: bool) -> Result<(), Error> {
        let poa = self.poa(ctx.call.poa_idx).ok_or(Error::UnknownObject)?;
        let activation = poa.get(ctx.call.object_id).ok_or(Error::UnknownObject)?;

        // A masked-out transport gets the same answer as a missing
        // object; callers learn nothing about what exists elsewhere.
        if !poa.admits(&activation, kind, ssl) {
            return Err(Error::UnknownObject);
        }

        activation.servant.dispatch(ctx, false)
    }

    /// Handle a `ReleaseObject` frame from a peer dropping its last proxy.
    pub fn release_frame(&self, frame: &FlatBuffer, refs: &ReferenceList) {
        if let Ok(call) = CallHeader::decode(frame, MESSAGE_HEADER_SIZE) {
            let entry = SessionRef {
                poa_idx: call.poa_idx,
                object_id: call.object_id,
            };
            refs.remove(&entry);
            self.release(entry);
        }
    }

    fn release(&self, entry: SessionRef) {
        if let Some(poa) = self.poa(entry.poa_idx)
            && poa.lifespan() == Lifespan::Transient
            && poa.deactivate(entry.object_id).is_some()
        {
            log::debug!(
                "transient servant released: oid=({}, {})",
                entry.poa_idx,
                entry.object_id
            );
        }
    }

    /// Session teardown: release every object the session handed out.
    /// Transient servants deactivate, persistent ones shrug it off.
    pub fn release_session(&self, refs: &ReferenceList) {
        for entry in refs.drain() {
            self.release(entry);
        }
    }
}

/// A connected peer: the submit handle plus the stream registry.
#[derive(Clone)]
pub struct Session {
    handle: Arc<dyn SessionHandle>,
    streams: Arc<StreamManager>,
}

impl Session {
    pub fn new(handle: Arc<dyn SessionHandle>, streams: Arc<StreamManager>) -> Self {
        Self { handle, streams }
    }

    /// A proxy for a remote object reachable over this session.
    pub fn object(&self, id: ObjectId) -> Object {
        Object::new(id, self.handle.clone())
    }

    pub fn handle(&self) -> &Arc<dyn SessionHandle> {
        &self.handle
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Attach to an inbound stream announced by the peer (id learned from
    /// a reply).
    pub fn stream_reader(&self, stream_id: u32) -> Result<StreamReader, Error> {
        self.streams.open_reader(stream_id, self.handle.clone())
    }

    /// Wind the session down; outstanding and queued work fails with
    /// `OperationAborted`.
    pub fn close(&self) {
        self.handle.close();
    }
}

#[derive(Default)]
struct BoundAddrs {
    tcp: Option<SocketAddr>,
    udp: Option<SocketAddr>,
    http: Option<SocketAddr>,
}

struct RpcInner {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    sessions: Mutex<HashMap<EndPoint, Session>>,
    bound: Mutex<BoundAddrs>,
    epoll: Mutex<Option<transport::epoll::EpollServer>>,
    shm_listener: Mutex<Option<Arc<shm::ShmListener>>>,
    shm_sessions: Mutex<Option<Arc<transport::shm::ShmRegistry>>>,
    running: AtomicBool,
}

/// The coordinator handle. Cheap to clone; all clones shut down together.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl Rpc {
    pub fn new(config: Config) -> Self {
        let dispatcher = Dispatcher::new(&config);

        Self {
            inner: Arc::new(RpcInner {
                config,
                dispatcher,
                sessions: Mutex::new(HashMap::with_capacity(16)),
                bound: Mutex::new(BoundAddrs::default()),
                epoll: Mutex::new(None),
                shm_listener: Mutex::new(None),
                shm_sessions: Mutex::new(None),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.inner.dispatcher.clone()
    }

    pub fn hostname(&self) -> &str {
        &self.inner.config.hostname
    }

    pub fn create_poa(&self, builder: PoaBuilder) -> Result<Arc<Poa>, Error> {
        self.inner.dispatcher.create_poa(builder)
    }

    /// Assemble a wire reference for a servant activated on `poa`.
    pub fn object_id(
        &self,
        poa: &Poa,
        object_id: u64,
        servant: &dyn ObjectServant,
        interface_idx: u8,
        endpoint: EndPoint,
    ) -> ObjectId {
        poa.object_id(
            object_id,
            servant.class_id(),
            interface_idx,
            self.hostname(),
            endpoint,
        )
    }

    /// The address the TCP listener actually bound (relevant with port 0).
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().tcp
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().udp
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().http
    }

    /// The endpoint remote peers should dial for this process's TCP
    /// transport.
    pub fn tcp_endpoint(&self) -> Option<EndPoint> {
        self.tcp_addr()
            .map(|addr| EndPoint::tcp(self.advertised_ip(), addr.port()))
    }

    pub fn udp_endpoint(&self) -> Option<EndPoint> {
        self.udp_addr()
            .map(|addr| EndPoint::udp(self.advertised_ip(), addr.port()))
    }

    pub fn shm_endpoint(&self) -> Option<EndPoint> {
        self.inner
            .config
            .listen_shm
            .as_ref()
            .map(|name| EndPoint::shared_memory(name.clone()))
    }

    fn advertised_ip(&self) -> Ipv4Addr {
        self.inner
            .config
            .hostname
            .parse()
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// Bind and start every transport the configuration enables, then
    /// return; the listeners run on spawned tasks until shutdown.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let config = &self.inner.config;
        let dispatcher = self.inner.dispatcher.clone();
        let max_message = config.max_message_size;

        if let Some(port) = config.listen_tcp_port {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

            if config.use_epoll_tcp {
                let server =
                    transport::epoll::EpollServer::spawn(dispatcher.clone(), addr, max_message)?;
                self.inner.bound.lock().tcp = Some(server.local_addr());
                *self.inner.epoll.lock() = Some(server);
            } else {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                self.inner.bound.lock().tcp = Some(listener.local_addr()?);
                tokio::spawn(transport::tcp::listen(
                    dispatcher.clone(),
                    listener,
                    max_message,
                ));
            }

            log::info!(
                "rpc tcp transport listening: addr={:?}, epoll={}",
                self.tcp_addr(),
                config.use_epoll_tcp
            );
        }

        if let Some(port) = config.listen_udp_port {
            let socket =
                tokio::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                    .await?;
            self.inner.bound.lock().udp = Some(socket.local_addr()?);
            tokio::spawn(transport::udp::serve(
                dispatcher.clone(),
                socket,
                max_message,
            ));

            log::info!("rpc udp transport listening: addr={:?}", self.udp_addr());
        }

        if let Some(http) = &config.http {
            if http.root_dir.is_some() || http.http3 || http.ssr {
                log::warn!("http root_dir/http3/ssr options are ignored by this build");
            }

            let listener = tokio::net::TcpListener::bind(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                http.port,
            )))
            .await?;
            self.inner.bound.lock().http = Some(listener.local_addr()?);
            tokio::spawn(transport::http::serve(
                dispatcher.clone(),
                listener,
                max_message,
            ));

            log::info!("rpc http transport listening: addr={:?}", self.http_addr());
        }

        if let Some(name) = &config.listen_shm {
            let listener = Arc::new(shm::ShmListener::bind(name)?);
            let registry = transport::shm::listen(
                &listener,
                dispatcher.clone(),
                config.shared_memory_size,
                max_message,
            );
            *self.inner.shm_listener.lock() = Some(listener);
            *self.inner.shm_sessions.lock() = Some(registry);
        }

        if config.listen_quic_port.is_some() {
            log::warn!("listen_quic_port is ignored by this build");
        }

        Ok(())
    }

    /// A session to a remote endpoint, reusing a cached one when its
    /// queue is still open. Tethered endpoints are never dialed; they are
    /// only valid over the inbound session they arrived on.
    pub async fn connect(&self, endpoint: &EndPoint) -> Result<Session, Error> {
        if endpoint.is_tethered() {
            return Err(Error::Policy);
        }

        if let Some(session) = self.inner.sessions.lock().get(endpoint)
            && session.handle().is_open()
        {
            return Ok(session.clone());
        }

        let dispatcher = self.inner.dispatcher.clone();
        let max_message = self.inner.config.max_message_size;

        let session = match endpoint.kind {
            TransportKind::Tcp => {
                let (handle, streams) =
                    transport::tcp::connect(dispatcher, endpoint.clone(), max_message)
                        .await
                        .map_err(|err| {
                            log::warn!("tcp connect failed: endpoint={}, err={}", endpoint, err);
                            Error::CommFailure
                        })?;
                Session::new(handle, streams)
            }
            TransportKind::Udp => {
                let (handle, streams) = transport::udp::connect(endpoint.clone()).await?;
                Session::new(handle, streams)
            }
            TransportKind::SharedMemory => {
                let (handle, streams) =
                    transport::shm::connect(dispatcher, endpoint.clone(), max_message)?;
                Session::new(handle, streams)
            }
            other => {
                log::warn!("no client transport for endpoint kind {:?}", other);
                return Err(Error::CommFailure);
            }
        };

        self.inner
            .sessions
            .lock()
            .insert(endpoint.clone(), session.clone());

        Ok(session)
    }

    /// A proxy for a remote object, dialing its endpoint if needed.
    pub async fn object(&self, id: &ObjectId) -> Result<Object, Error> {
        let session = self.connect(&id.endpoint).await?;
        Ok(session.object(id.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Tear everything down: stop listeners, close cached sessions. Safe
    /// to call more than once.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }

        if let Some(server) = self.inner.epoll.lock().take() {
            server.stop();
        }

        if let Some(listener) = self.inner.shm_listener.lock().take() {
            listener.stop();
        }

        if let Some(registry) = self.inner.shm_sessions.lock().take() {
            registry.close_all();
        }

        for (_, session) in self.inner.sessions.lock().drain() {
            session.handle().close();
        }

        log::info!("rpc shut down");
    }
}

impl Drop for RpcInner {
    fn drop(&mut self) {
        if let Some(server) = self.epoll.get_mut().take() {
            server.stop();
        }
    }
}
