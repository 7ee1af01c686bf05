//! amqpd library
//!
//! Server side of AMQP 1.0 connection establishment: protocol header
//! negotiation, SASL, and the OPEN exchange, plus a TCP listener that runs it
//! for every accepted socket.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod incoming;
pub mod protocol;
pub(crate) mod reader;
pub mod sasl;
pub mod server;
pub(crate) mod writer;

pub use error::{ConnError, SaslError};
pub use incoming::{ConnectionConfig, IncomingConnection};
pub use server::{AcceptPolicy, Decision, RequireAuthenticated, Server, ServerHandle};
