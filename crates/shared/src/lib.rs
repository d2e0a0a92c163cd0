//! RelayDesk Shared Types and Utilities
//!
//! This crate contains the domain types, wire envelopes, errors and the
//! durable store contract shared by the relay server and session clients.

pub mod db;
pub mod envelope;
pub mod error;
pub mod store;
pub mod types;

pub use db::*;
pub use envelope::{Envelope, Handshake, TicketUpdate, TypingSignal};
pub use error::*;
pub use store::{AppendAck, Cursor, DurableStore, MemoryStore, PgStore, StoreEvent, StoreStream};
pub use types::*;
