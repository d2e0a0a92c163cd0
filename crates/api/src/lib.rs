//! RelayDesk API Library
//!
//! This crate contains the relay server components: the websocket transport,
//! the operator ticket queue and its HTTP surface.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tickets;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
