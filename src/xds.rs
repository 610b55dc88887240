mod client;
mod delta;
mod error;
mod orchestrator;
mod registry;
mod request;
mod resources;
mod server;
mod session;
mod sotw;

pub use client::{ClientSession, ServerOptions};
pub use delta::Delta;
pub use error::XdsError;
pub use orchestrator::PushOrchestrator;
pub use registry::{ConnectionRegistry, ConnectionRegistryEntry};
pub use request::XdsRequest;
pub use resources::{ResourceType, ADD_ORDER, REMOVE_ORDER};
pub use server::{serve, AdsServer};
pub use session::{Phase, TypeSession, XdsProtocol};
pub use sotw::Sotw;

pub(crate) use error::Teardown;

use smol_str::{SmolStr, ToSmolStr};
use svix_ksuid::{Ksuid, KsuidLike};

/// The two flavors of the xDS protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// State of the world. Every request and response carries the full set of
    /// resource names.
    Sotw,

    /// Incremental. Requests subscribe and unsubscribe by name and responses
    /// carry only what changed.
    Delta,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Sotw => "sotw",
            Protocol::Delta => "delta",
        }
    }
}

/// Generate a fresh, opaque response nonce.
pub(crate) fn next_nonce() -> SmolStr {
    Ksuid::new(None, None).to_smolstr()
}
