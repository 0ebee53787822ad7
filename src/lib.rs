//! ## flatwire
//!
//! A multi-transport RPC framework: flat in-place binary marshalling, a
//! portable object adapter with generation-tagged object ids, and
//! polymorphic proxy/servant dispatch over TCP, WebSocket, HTTP, UDP and
//! zero-copy shared memory.
//!
//! The workspace splits along concern lines: [`codec`] holds the flat
//! buffer and wire forms, [`shm`] the shared-memory rings, [`service`]
//! the object core and session state, and this crate the transports, the
//! [`Rpc`] coordinator, and the nameserver daemon.

pub mod config;
pub mod nameserver;
pub mod rpc;
pub mod session;
pub mod transport;

pub use codec;
pub use service;
pub use shm;

pub use self::{
    config::Config,
    rpc::{Dispatcher, Rpc, Session},
};

use std::sync::Arc;

use service::poa::{IdPolicy, Lifespan, PoaBuilder, activation};

/// Start a nameserver process over an [`Rpc`] built from `config`: POA 0
/// with the well-known object id, every configured transport listening.
///
/// Split out of the binary so integration tests can host the daemon
/// in-process.
pub async fn server_main(config: Config) -> anyhow::Result<Rpc> {
    let rpc = Rpc::new(config);

    let poa = rpc.create_poa(
        PoaBuilder::new()
            .max_objects(1)
            .lifespan(Lifespan::Persistent)
            .id_policy(IdPolicy::UserSupplied),
    )?;

    poa.activate_with_id(
        nameserver::NAMESERVER_OBJECT_ID,
        Arc::new(nameserver::NameserverServant::new()),
        activation::ALLOW_ALL,
    )?;

    rpc.serve().await?;
    log::info!("nameserver up: hostname={}", rpc.hostname());

    Ok(rpc)
}
