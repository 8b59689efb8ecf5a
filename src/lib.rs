//! # duplex-rpc
//!
//! A bidirectional, promise-based RPC runtime carried over
//! length-self-delimiting MessagePack frames on any duplex byte stream.
//!
//! Either side of a [`Peer`](peer::Peer) may issue requests (expecting a
//! reply), send events (fire-and-forget), or -- via a [`Service`](service::Service)
//! -- answer requests routed to dynamically registered objects and
//! broadcast signals to every connected peer.

pub mod codec;
pub mod config;
pub mod peer;
pub mod promise;
pub mod service;
pub mod value;

pub use codec::{CodecError, Message, MessageKind};
pub use config::{ConfigError, PeerConfig, ServiceConfig};
pub use peer::{IncomingRequest, Inbound, Peer, PeerError, PeerEvents};
pub use promise::{Promise, Resolver};
pub use service::{HandlerFn, HandlerOutcome, ObjectBuilder, ObjectHandle, Service, ServiceError};
pub use value::{FromValue, Value};
