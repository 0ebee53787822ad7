//! HTTP and WebSocket transports, one axum router for both.
//!
//! Unary calls arrive as `POST /rpc` with an `application/octet-stream`
//! body holding the frame (no outer length; HTTP delimits it). Cookies
//! pass through both ways: the request's `Cookie` header lands in the
//! dispatch context, and `Set-Cookie` values a servant appends go out on
//! the response. `GET /rpc` upgrades to a WebSocket carrying one frame
//! per binary message, driven by the ordinary session driver.

use crate::{
    rpc::Dispatcher,
    session::{FrameTransport, SessionParams, drive},
};

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use codec::{
    FlatBuffer,
    endpoint::{EndPoint, TransportKind},
    header::{MESSAGE_HEADER_SIZE, MessageHeader},
};
use service::{
    ReferenceList, SessionContext, SessionHandle,
    session::session_queue,
    stream::StreamManager,
};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    max_message: usize,
}

pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    listener: tokio::net::TcpListener,
    max_message: usize,
) {
    let app = Router::new()
        .route("/rpc", post(unary).get(upgrade))
        .with_state(AppState {
            dispatcher,
            max_message,
        });

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        log::error!("http server close: err={}", err);
    }
}

fn peer_endpoint(addr: SocketAddr, websocket: bool) -> EndPoint {
    let (ip, port) = match addr {
        SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
        SocketAddr::V6(_) => (std::net::Ipv4Addr::UNSPECIFIED, addr.port()),
    };

    if websocket {
        EndPoint::websocket(ip, port, false)
    } else {
        EndPoint::http(ip, port, false)
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();

    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.to_string(), value.to_string()));
            }
        }
    }

    cookies
}

async fn unary(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() < MESSAGE_HEADER_SIZE || body.len() > state.max_message {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let frame = FlatBuffer::from_bytes(&body);
    let valid = matches!(
        MessageHeader::decode(&frame, 0),
        Ok(header) if header.size as usize == body.len() - 4
    );
    if !valid {
        return StatusCode::BAD_REQUEST.into_response();
    }

    // Each request is its own short-lived session; references handed out
    // here do not survive the response.
    let refs = ReferenceList::new();
    let mut ctx = SessionContext::new(peer_endpoint(addr, false), refs.clone());
    ctx.rx = frame;
    ctx.cookies = parse_cookies(&headers);

    let wants_reply = state
        .dispatcher
        .dispatch_ctx(&mut ctx, TransportKind::Http, false);
    state.dispatcher.release_session(&refs);

    let mut response = if wants_reply {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::copy_from_slice(ctx.tx.data()),
        )
            .into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    };

    for cookie in &ctx.set_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        log::info!("websocket session accept: addr={:?}", addr);

        let remote = peer_endpoint(addr, true);
        let transport = WsTransport {
            socket,
            max_message: state.max_message,
        };

        let (sender, receiver) = session_queue(remote.clone());
        let handle: Arc<dyn SessionHandle> = sender;

        drive(
            transport,
            receiver,
            handle,
            state.dispatcher,
            StreamManager::new(),
            ReferenceList::new(),
            SessionParams {
                remote,
                kind: TransportKind::WebSocket,
                ssl: false,
            },
        )
        .await;

        log::info!("websocket session closed: addr={:?}", addr);
    })
}

struct WsTransport {
    socket: WebSocket,
    max_message: usize,
}

impl FrameTransport for WsTransport {
    async fn recv(&mut self) -> io::Result<Option<FlatBuffer>> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(bytes))) => {
                    if bytes.len() < MESSAGE_HEADER_SIZE || bytes.len() > self.max_message {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "websocket frame size out of bounds",
                        ));
                    }

                    return Ok(Some(FlatBuffer::from_bytes(&bytes)));
                }
                // Control messages are the websocket layer's business.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket
            .send(Message::Binary(Bytes::copy_from_slice(frame)))
            .await
            .map_err(io::Error::other)
    }
}
