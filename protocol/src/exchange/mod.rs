//! # Exchange Module
//!
//! Who is nearby ([`PeerRegistry`]) and how an intent is offered to them
//! ([`ExchangeProtocol`]).

pub mod peers;
pub mod protocol;

pub use peers::{PeerDevice, PeerRegistry, TransportKind};
pub use protocol::{
    ExchangeBody, ExchangeProtocol, ExchangeRequest, ExchangeResponse, ExchangeStatus,
    RequestState, WireMessage,
};
