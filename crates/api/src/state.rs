//! Application state shared by all handlers

use std::sync::Arc;

use sqlx::PgPool;

use relaydesk_shared::{DurableStore, MemoryStore, PgStore};

use crate::config::Config;
use crate::tickets::{MemoryTicketStore, PgTicketStore, TicketService, TicketStore};
use crate::websocket::WebSocketState;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Absent when running on the in-memory store
    pub pool: Option<PgPool>,
    pub store: Arc<dyn DurableStore>,
    pub tickets: Arc<TicketService>,
    pub ws_state: WebSocketState,
}

impl AppState {
    fn build(
        config: Config,
        pool: Option<PgPool>,
        store: Arc<dyn DurableStore>,
        ticket_store: Arc<dyn TicketStore>,
    ) -> Self {
        let ws_state = WebSocketState::new();
        let tickets = Arc::new(TicketService::new(
            ticket_store,
            Arc::clone(&store),
            ws_state.clone(),
            config.store_append_retries,
        ));
        Self {
            config: Arc::new(config),
            pool,
            store,
            tickets,
            ws_state,
        }
    }

    /// Message log and ticket board kept in process memory
    pub fn in_memory(config: Config) -> Self {
        Self::build(
            config,
            None,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTicketStore::new()),
        )
    }

    /// Message log and ticket board in Postgres
    pub fn postgres(config: Config, pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool.clone(), config.store_poll_interval()));
        let tickets = Arc::new(PgTicketStore::new(pool.clone()));
        Self::build(config, Some(pool), store, tickets)
    }
}
