//! Portable object adapter.
//!
//! A POA owns a range of object ids and the servants behind them. Its
//! policies are fixed at build time: how ids are produced (system
//! generated out of the slot table, or user supplied within
//! `[0, max_objects)`), whether servants outlive sessions, and which
//! transports may reach them.

use crate::{Error, object::ObjectServant, table::IdTable};

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use codec::{
    endpoint::{EndPoint, TransportKind},
    oid::{self, ObjectId},
};
use parking_lot::RwLock;

/// Transport admission mask for an activation.
pub mod activation {
    pub const ALLOW_TCP: u32 = 1;
    pub const ALLOW_WEBSOCKET: u32 = 1 << 1;
    pub const ALLOW_SSL_WEBSOCKET: u32 = 1 << 2;
    pub const ALLOW_HTTP: u32 = 1 << 3;
    pub const ALLOW_SHARED_MEMORY: u32 = 1 << 4;
    pub const ALLOW_UDP: u32 = 1 << 5;
    pub const ALLOW_ALL: u32 = ALLOW_TCP
        | ALLOW_WEBSOCKET
        | ALLOW_SSL_WEBSOCKET
        | ALLOW_HTTP
        | ALLOW_SHARED_MEMORY
        | ALLOW_UDP;

    use codec::endpoint::TransportKind;

    /// The mask bit a given ingress transport checks.
    pub fn bit_for(kind: TransportKind, ssl: bool) -> u32 {
        match kind {
            TransportKind::Tcp | TransportKind::TcpTethered => ALLOW_TCP,
            TransportKind::WebSocket | TransportKind::WebSocketTethered => {
                if ssl {
                    ALLOW_SSL_WEBSOCKET
                } else {
                    ALLOW_WEBSOCKET
                }
            }
            TransportKind::Http | TransportKind::Quic => ALLOW_HTTP,
            TransportKind::SharedMemory | TransportKind::SharedMemoryTethered => {
                ALLOW_SHARED_MEMORY
            }
            TransportKind::Udp => ALLOW_UDP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Released when the session that activated it goes down.
    Transient,
    /// Decoupled from sessions.
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPolicy {
    SystemGenerated,
    UserSupplied,
}

#[derive(Clone)]
pub struct Activation {
    pub servant: Arc<dyn ObjectServant>,
    pub flags: u32,
}

/// Build-time POA configuration; immutable afterwards.
pub struct PoaBuilder {
    max_objects: usize,
    lifespan: Lifespan,
    policy: IdPolicy,
}

impl Default for PoaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoaBuilder {
    pub fn new() -> Self {
        Self {
            max_objects: 1024,
            lifespan: Lifespan::Persistent,
            policy: IdPolicy::SystemGenerated,
        }
    }

    pub fn max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn id_policy(mut self, policy: IdPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Finalise under the index its registry assigned.
    pub fn build(self, index: u16) -> Arc<Poa> {
        Arc::new(Poa {
            index,
            lifespan: self.lifespan,
            policy: self.policy,
            max_objects: self.max_objects,
            system: IdTable::new(self.max_objects),
            user: RwLock::new(HashMap::with_capacity(self.max_objects.min(1024))),
        })
    }
}

pub struct Poa {
    index: u16,
    lifespan: Lifespan,
    policy: IdPolicy,
    max_objects: usize,
    /// Slot table backing `SystemGenerated` ids.
    system: IdTable<Activation>,
    /// Explicit map backing `UserSupplied` ids.
    user: RwLock<HashMap<u64, Activation>>,
}

impl Poa {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    pub fn id_policy(&self) -> IdPolicy {
        self.policy
    }

    /// Activate under a system-generated id. Rejected on `UserSupplied`
    /// POAs.
    pub fn activate(
        &self,
        servant: Arc<dyn ObjectServant>,
        flags: u32,
    ) -> Result<u64, Error> {
        if self.policy != IdPolicy::SystemGenerated {
            return Err(Error::Policy);
        }

        self.system
            .add(Activation { servant, flags })
            .ok_or(Error::BufferFull)
    }

    /// Activate under a caller-chosen id in `[0, max_objects)`. Rejected
    /// on `SystemGenerated` POAs; the id must be unused.
    pub fn activate_with_id(
        &self,
        object_id: u64,
        servant: Arc<dyn ObjectServant>,
        flags: u32,
    ) -> Result<(), Error> {
        if self.policy != IdPolicy::UserSupplied {
            return Err(Error::Policy);
        }

        if object_id >= self.max_objects as u64 {
            return Err(Error::Policy);
        }

        let mut user = self.user.write();
        if user.contains_key(&object_id) {
            return Err(Error::Policy);
        }

        user.insert(object_id, Activation { servant, flags });
        Ok(())
    }

    /// Remove the slot; a reused slot gets a new generation, so stale ids
    /// keep failing.
    pub fn deactivate(&self, object_id: u64) -> Option<Arc<dyn ObjectServant>> {
        let activation = match self.policy {
            IdPolicy::SystemGenerated => self.system.remove(&object_id),
            IdPolicy::UserSupplied => self.user.write().remove(&object_id),
        }?;

        Some(activation.servant)
    }

    pub fn get(&self, object_id: u64) -> Option<Activation> {
        match self.policy {
            IdPolicy::SystemGenerated => self.system.get(&object_id),
            IdPolicy::UserSupplied => self.user.read().get(&object_id).cloned(),
        }
    }

    /// Admission check for an ingress transport.
    pub fn admits(&self, activation: &Activation, kind: TransportKind, ssl: bool) -> bool {
        activation.flags & activation::bit_for(kind, ssl) != 0
    }

    pub fn object_count(&self) -> usize {
        match self.policy {
            IdPolicy::SystemGenerated => self.system.len(),
            IdPolicy::UserSupplied => self.user.read().len(),
        }
    }

    /// Assemble the wire reference for an activated object.
    pub fn object_id(
        &self,
        object_id: u64,
        class_id: &str,
        interface_idx: u8,
        hostname: &str,
        endpoint: EndPoint,
    ) -> ObjectId {
        let mut flags = 0;
        if !class_id.is_empty() {
            flags |= oid::flags::HAS_CLASS_ID;
        }
        if endpoint.is_tethered() {
            flags |= oid::flags::TETHERED;
        }

        ObjectId {
            object_id,
            poa_idx: self.index,
            flags,
            interface_idx,
            class_id: class_id.to_string(),
            hostname: hostname.to_string(),
            endpoint,
        }
    }
}
