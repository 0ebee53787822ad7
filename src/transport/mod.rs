//! Concrete transports.
//!
//! Each submodule binds one wire to the session machinery: the async TCP
//! acceptor and client, its raw-epoll sibling, UDP datagrams, the axum
//! HTTP/WebSocket server, and the shared-memory channel.

pub mod epoll;
pub mod http;
pub mod shm;
pub mod tcp;
pub mod udp;
