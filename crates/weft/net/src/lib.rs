//! Transport-facing layer of the runtime: the [`Connection`] abstraction with
//! its plugin chain, the message codec, and the [`ConnectionRouteManager`]
//! that keeps one durable logical link alive per
//! `(local key, remote key, group)` by trying every configured route.
//!
//! The transport itself is out of scope: anything able to pump
//! [`Frame`]s into a [`Pipe`] (a websocket adapter, a relay client) can carry
//! connections. The in-memory [`MemoryHub`] plays the role of both a relay
//! ("commserver") and direct sockets in tests and demos.

pub mod codec;
mod connection;
mod handshake;
mod hub;
mod manager;
mod pipe;
pub mod plugins;
mod route;

pub use self::connection::{CloseOrigin, Connection, ConnectionError, MAX_CLOSE_REASON_BYTES};
pub use self::handshake::{accept_encrypted, connect_encrypted, HandshakeError};
pub use self::hub::{MemoryHub, TransportError, TransportListener, TransportProvider};
pub use self::manager::{
	ConnectionRouteManager, EstablishedConnection, RouteManagerConfig,
};
pub use self::pipe::{pipe_pair, Frame, Pipe, PipeEvent, PipeSender};
pub use self::route::{commserver_address, RouteId, RouteKind, RouteState};
