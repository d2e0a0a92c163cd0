//! Operator ticket queue routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relaydesk_shared::{ParticipantId, Ticket, TicketId, TicketPriority, TicketStatus};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
    tickets::TicketPatch,
};

#[derive(Debug, Deserialize)]
pub struct ListTicketsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TicketListResponse {
    pub tickets: Vec<Ticket>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTicketRequest {
    pub status: Option<TicketStatus>,
    pub assigned_operator_id: Option<ParticipantId>,
    pub priority: Option<TicketPriority>,
    /// Operator performing the change, recorded in logs
    pub actor_id: Option<ParticipantId>,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub text: String,
    pub author: ParticipantId,
}

/// List tickets, most recent activity first
pub async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<ListTicketsQuery>,
) -> ApiResult<Json<TicketListResponse>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<TicketStatus>().map_err(ApiError::BadRequest)?),
        None => None,
    };

    let tickets = state.tickets.list(status).await?;
    Ok(Json(TicketListResponse {
        total: tickets.len(),
        tickets,
    }))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<Ticket>> {
    Ok(Json(state.tickets.get(TicketId(ticket_id)).await?))
}

/// Claim, reassign, close or reprioritise a ticket
pub async fn update_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> ApiResult<Json<Ticket>> {
    if req.status.is_none() && req.assigned_operator_id.is_none() && req.priority.is_none() {
        return Err(ApiError::BadRequest(
            "Provide at least one of status, assignedOperatorId, priority".to_string(),
        ));
    }

    let patch = TicketPatch {
        status: req.status,
        assigned_operator_id: req.assigned_operator_id,
        priority: req.priority,
    };
    let ticket = state
        .tickets
        .update(TicketId(ticket_id), patch, req.actor_id)
        .await?;
    Ok(Json(ticket))
}

/// Append an internal note. Never changes status or assignee.
pub async fn add_note(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<AddNoteRequest>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .tickets
        .add_note(TicketId(ticket_id), req.text, req.author)
        .await?;
    Ok(Json(ticket))
}
