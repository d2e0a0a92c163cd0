//! Ticket state machine
//!
//! ```text
//! waiting --claim+assign--> inProgress --close--> completed
//!    ^                                               |
//!    +-------------- new user message ---------------+
//! ```
//!
//! Pure functions over a ticket snapshot. Persisting the resulting change
//! and its side effects is the service's job.

use serde::Deserialize;

use relaydesk_shared::{Cursor, ParticipantId, Ticket, TicketPriority, TicketStatus};

use super::TicketError;

/// Operator request against a ticket
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub assigned_operator_id: Option<ParticipantId>,
    pub priority: Option<TicketPriority>,
}

/// Fields that change; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketChange {
    pub status: Option<TicketStatus>,
    pub assigned_operator_id: Option<Option<ParticipantId>>,
    pub priority: Option<TicketPriority>,
    /// Cursor of the closure message; recorded when the change completes
    pub closed_at_cursor: Option<Cursor>,
}

impl TicketChange {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.assigned_operator_id.is_none() && self.priority.is_none()
    }

    /// The change moves the ticket into `completed`
    pub fn completes(&self) -> bool {
        self.status == Some(TicketStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Target state already holds
    NoOp,
    Changed(TicketChange),
}

/// Validate an operator request against the current ticket
pub fn apply(ticket: &Ticket, patch: &TicketPatch) -> Result<Transition, TicketError> {
    let from = ticket.status;
    let to = patch.status.unwrap_or(from);
    let invalid = |reason| Err(TicketError::InvalidTransition { from, reason });

    let assignee = match (from, to) {
        (TicketStatus::Waiting, TicketStatus::Waiting) => {
            if patch.assigned_operator_id.is_some() {
                return invalid("assigning a waiting ticket requires claiming it");
            }
            None
        }
        (TicketStatus::Waiting, TicketStatus::InProgress) => match patch.assigned_operator_id {
            Some(operator) => Some(operator),
            None => return invalid("claiming requires assignedOperatorId"),
        },
        (TicketStatus::Waiting, TicketStatus::Completed) => {
            return invalid("a waiting ticket must be claimed before it can be completed")
        }
        (_, TicketStatus::Waiting) => {
            return invalid("tickets return to waiting only on new user activity")
        }
        (TicketStatus::Completed, TicketStatus::InProgress) => {
            return invalid("completed tickets reopen only on new user activity")
        }
        // Reassignment while in progress or completed, and close
        (TicketStatus::InProgress, _) | (TicketStatus::Completed, TicketStatus::Completed) => {
            patch.assigned_operator_id
        }
    };

    let mut change = TicketChange::default();
    if to != from {
        change.status = Some(to);
    }
    if let Some(operator) = assignee {
        if ticket.assigned_operator_id != Some(operator) {
            change.assigned_operator_id = Some(Some(operator));
        }
    }
    if let Some(priority) = patch.priority {
        if priority != ticket.priority {
            change.priority = Some(priority);
        }
    }

    if change.is_empty() {
        Ok(Transition::NoOp)
    } else {
        Ok(Transition::Changed(change))
    }
}

/// A user wrote into a completed conversation: back to the queue, unassigned
pub fn reactivate(ticket: &Ticket) -> Transition {
    if ticket.status != TicketStatus::Completed {
        return Transition::NoOp;
    }
    Transition::Changed(TicketChange {
        status: Some(TicketStatus::Waiting),
        assigned_operator_id: Some(None),
        ..TicketChange::default()
    })
}
