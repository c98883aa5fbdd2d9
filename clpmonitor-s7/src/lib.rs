//! clpmonitor S7 client
//!
//! Data block access to S7 controllers over ISO-on-TCP.
//!
//! # Overview
//!
//! - [`PlcClient`] for raw and typed reads and writes on one session
//! - [`Connector`] for opening a fresh session per logical operation
//! - [`TagAddress`] / [`TagValue`] for typed tags and their byte layout
//! - [`TagDescriptor`] / [`TagWrite`] for resolving operator write requests
//! - [`SimulatedPlc`] for an in-memory controller, in-process or over TCP
//!
//! # Example
//!
//! ```ignore
//! use clpmonitor_s7::{Connector, Endpoint};
//!
//! let connector = Connector::new(Endpoint::new("10.74.241.10", 102));
//! let mut client = connector.connect().await?;
//! let colours = client.read_block(9, 68, 28).await?;
//! client.disconnect().await;
//! ```

mod client;
pub mod codec;
mod connector;
mod error;
pub mod hex;
pub mod pdu;
mod request;
mod sim;
pub mod tag;
mod transport;

pub use client::PlcClient;
pub use codec::TpktCodec;
pub use connector::{Connector, DEFAULT_PORT, DEFAULT_TIMEOUT, Endpoint};
pub use error::{ErrorKind, PlcError, Result};
pub use request::{TagDescriptor, TagWrite};
pub use sim::SimulatedPlc;
pub use tag::{TagAddress, TagKind, TagValue};
pub use transport::{TcpFactory, TcpTransport, Transport, TransportFactory};
