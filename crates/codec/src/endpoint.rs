//! Endpoint identity.

use crate::{Error, FlatBuffer, flat};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transport discriminant carried inside object references.
///
/// The `*Tethered` variants designate endpoints that are only valid inside
/// an existing inbound session — callbacks travelling back over the same
/// connection. They are never dialed anew.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum TransportKind {
    Tcp = 0,
    TcpTethered = 1,
    WebSocket = 2,
    WebSocketTethered = 3,
    Http = 4,
    SharedMemory = 5,
    SharedMemoryTethered = 6,
    Udp = 7,
    Quic = 8,
}

impl TransportKind {
    pub fn is_tethered(self) -> bool {
        matches!(
            self,
            Self::TcpTethered | Self::WebSocketTethered | Self::SharedMemoryTethered
        )
    }
}

/// Where a peer lives: an IPv4 socket for the networked transports, a
/// channel id string for shared memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostId {
    Socket { ip: Ipv4Addr, port: u16 },
    Channel(String),
}

/// A dialable (or tethered) peer address. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    pub kind: TransportKind,
    pub ssl: bool,
    pub host: HostId,
}

/// Fixed wire footprint: kind, ssl, port, ipv4, channel `{offset, count}`.
pub const ENDPOINT_SIZE: usize = 16;

impl EndPoint {
    pub fn tcp(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            ssl: false,
            host: HostId::Socket { ip, port },
        }
    }

    pub fn udp(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            kind: TransportKind::Udp,
            ssl: false,
            host: HostId::Socket { ip, port },
        }
    }

    pub fn websocket(ip: Ipv4Addr, port: u16, ssl: bool) -> Self {
        Self {
            kind: TransportKind::WebSocket,
            ssl,
            host: HostId::Socket { ip, port },
        }
    }

    pub fn http(ip: Ipv4Addr, port: u16, ssl: bool) -> Self {
        Self {
            kind: TransportKind::Http,
            ssl,
            host: HostId::Socket { ip, port },
        }
    }

    pub fn shared_memory(channel_id: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::SharedMemory,
            ssl: false,
            host: HostId::Channel(channel_id.into()),
        }
    }

    /// The tethered twin of this endpoint, for references handed to a peer
    /// that must call back over the session they arrived on.
    pub fn tethered(&self) -> Self {
        let kind = match self.kind {
            TransportKind::Tcp | TransportKind::TcpTethered => TransportKind::TcpTethered,
            TransportKind::WebSocket | TransportKind::WebSocketTethered => {
                TransportKind::WebSocketTethered
            }
            TransportKind::SharedMemory | TransportKind::SharedMemoryTethered => {
                TransportKind::SharedMemoryTethered
            }
            other => other,
        };

        Self {
            kind,
            ssl: self.ssl,
            host: self.host.clone(),
        }
    }

    pub fn is_tethered(&self) -> bool {
        self.kind.is_tethered()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            HostId::Socket { ip, port } => {
                Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port)))
            }
            HostId::Channel(_) => None,
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match &self.host {
            HostId::Channel(id) => Some(id),
            HostId::Socket { .. } => None,
        }
    }

    /// Append the flat form at `base` inside an already reserved block.
    pub fn encode(&self, buf: &mut FlatBuffer, base: usize) -> Result<(), Error> {
        flat::put(buf, base, u8::from(self.kind))?;
        flat::put(buf, base + 1, self.ssl)?;

        match &self.host {
            HostId::Socket { ip, port } => {
                flat::put(buf, base + 2, *port)?;
                flat::put(buf, base + 4, u32::from_le_bytes(ip.octets()))?;
                flat::alloc_bytes(buf, base + 8, &[])?;
            }
            HostId::Channel(id) => {
                flat::alloc_str(buf, base + 8, id)?;
            }
        }

        Ok(())
    }

    pub fn decode(buf: &FlatBuffer, base: usize) -> Result<Self, Error> {
        let kind = TransportKind::try_from(flat::get::<u8>(buf, base)?)
            .map_err(|_| Error::UnknownEnumValue)?;
        let ssl = flat::get::<bool>(buf, base + 1)?;

        let host = match kind {
            TransportKind::SharedMemory | TransportKind::SharedMemoryTethered => {
                HostId::Channel(flat::get_str(buf, base + 8)?.to_string())
            }
            _ => HostId::Socket {
                port: flat::get(buf, base + 2)?,
                ip: Ipv4Addr::from(u32::to_le_bytes(flat::get(buf, base + 4)?)),
            },
        };

        Ok(Self { kind, ssl, host })
    }
}

impl std::fmt::Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            HostId::Socket { ip, port } => {
                write!(f, "{:?}://{}:{}", self.kind, ip, port)
            }
            HostId::Channel(id) => write!(f, "{:?}://{}", self.kind, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_endpoint_roundtrip() {
        let endpoint = EndPoint::tcp(Ipv4Addr::new(10, 0, 0, 7), 15000);

        let mut buf = FlatBuffer::new();
        let base = flat::reserve_struct(&mut buf, ENDPOINT_SIZE).unwrap();
        endpoint.encode(&mut buf, base).unwrap();

        assert_eq!(EndPoint::decode(&buf, base).unwrap(), endpoint);
    }

    #[test]
    fn channel_endpoint_roundtrip() {
        let endpoint = EndPoint::shared_memory("f2a9c644");

        let mut buf = FlatBuffer::new();
        let base = flat::reserve_struct(&mut buf, ENDPOINT_SIZE).unwrap();
        endpoint.encode(&mut buf, base).unwrap();

        assert_eq!(EndPoint::decode(&buf, base).unwrap(), endpoint);
    }

    #[test]
    fn tethered_twins() {
        let endpoint = EndPoint::tcp(Ipv4Addr::LOCALHOST, 15000);
        assert!(!endpoint.is_tethered());

        let tethered = endpoint.tethered();
        assert_eq!(tethered.kind, TransportKind::TcpTethered);
        assert!(tethered.is_tethered());
        assert_eq!(tethered.host, endpoint.host);

        // Already-tethered and non-session kinds are stable.
        assert_eq!(tethered.tethered().kind, TransportKind::TcpTethered);
        let udp = EndPoint::udp(Ipv4Addr::LOCALHOST, 15001);
        assert_eq!(udp.tethered().kind, TransportKind::Udp);
    }
}
