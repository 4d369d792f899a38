//! Sockets and the bytes that move through them.
//!
//! - [`Poller`] / [`Epoll`]: one-shot readiness notification for stream
//!   descriptors
//! - [`Acceptor`] / [`DatagramAcceptor`]: bound listeners feeding the reactor
//! - [`Connection`]: one peer, its outbound queue and its idempotent close
//! - [`Framing`]: cuts messages out of a connection's inbound bytes

pub use acceptor::{Acceptor, Dispatch, SocketOptions};
pub use connection::{Connection, ConnectionOwner, Transport};
pub use datagram::DatagramAcceptor;
pub use frame::Framing;
pub use poller::{Epoll, Poller, Readiness};

mod acceptor;
mod connection;
mod datagram;
mod frame;
mod poller;
