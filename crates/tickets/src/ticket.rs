use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use herald_core::{AggregateId, AggregateRoot, ConcurrencyToken, DomainError, DomainResult};
use herald_events::{Event, EventBuffer, EventRegistry, EventSource};

const MAX_TITLE_LEN: usize = 200;

/// Ticket identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub AggregateId);

impl TicketId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TicketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<TicketId> for AggregateId {
    fn from(value: TicketId) -> Self {
        value.0
    }
}

/// Ticket status lifecycle. Tickets are never deleted, only closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
}

/// Aggregate root: Ticket.
///
/// Persisted as a row; the event buffer and concurrency token are transient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    id: TicketId,
    title: String,
    description: String,
    assignee: Option<String>,
    status: TicketStatus,
    resolution: Option<String>,

    #[serde(skip)]
    token: ConcurrencyToken,
    #[serde(skip)]
    events: EventBuffer<TicketEvent>,
}

/// Event: TicketCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCreated {
    pub ticket_id: TicketId,
    pub title: String,
}

/// Event: TicketUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketUpdated {
    pub ticket_id: TicketId,
    pub old_title: String,
    pub new_title: String,
}

/// Event: TicketAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAssigned {
    pub ticket_id: TicketId,
    pub previous_assignee: Option<String>,
    pub assignee: String,
}

/// Event: TicketClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClosed {
    pub ticket_id: TicketId,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketEvent {
    Created(TicketCreated),
    Updated(TicketUpdated),
    Assigned(TicketAssigned),
    Closed(TicketClosed),
}

impl TicketEvent {
    pub const CREATED: &'static str = "ticket.created";
    pub const UPDATED: &'static str = "ticket.updated";
    pub const ASSIGNED: &'static str = "ticket.assigned";
    pub const CLOSED: &'static str = "ticket.closed";

    pub fn ticket_id(&self) -> TicketId {
        match self {
            TicketEvent::Created(e) => e.ticket_id,
            TicketEvent::Updated(e) => e.ticket_id,
            TicketEvent::Assigned(e) => e.ticket_id,
            TicketEvent::Closed(e) => e.ticket_id,
        }
    }

    /// Decoders for every ticket event type.
    pub fn registry() -> EventRegistry<TicketEvent> {
        let mut registry = EventRegistry::<TicketEvent>::new();
        registry
            .register(Self::CREATED, |v| {
                TicketCreated::deserialize(v).map(TicketEvent::Created)
            })
            .register(Self::UPDATED, |v| {
                TicketUpdated::deserialize(v).map(TicketEvent::Updated)
            })
            .register(Self::ASSIGNED, |v| {
                TicketAssigned::deserialize(v).map(TicketEvent::Assigned)
            })
            .register(Self::CLOSED, |v| {
                TicketClosed::deserialize(v).map(TicketEvent::Closed)
            });
        registry
    }
}

impl Event for TicketEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TicketEvent::Created(_) => Self::CREATED,
            TicketEvent::Updated(_) => Self::UPDATED,
            TicketEvent::Assigned(_) => Self::ASSIGNED,
            TicketEvent::Closed(_) => Self::CLOSED,
        }
    }

    fn encode(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            TicketEvent::Created(e) => serde_json::to_value(e),
            TicketEvent::Updated(e) => serde_json::to_value(e),
            TicketEvent::Assigned(e) => serde_json::to_value(e),
            TicketEvent::Closed(e) => serde_json::to_value(e),
        }
    }
}

impl Ticket {
    /// Open a new ticket. Raises `ticket.created`.
    pub fn open(
        id: TicketId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> DomainResult<Self> {
        let title = validate_title(title.into())?;
        let mut ticket = Self {
            id,
            title: title.clone(),
            description: description.into(),
            assignee: None,
            status: TicketStatus::Open,
            resolution: None,
            token: ConcurrencyToken::UNSAVED,
            events: EventBuffer::new(),
        };
        ticket.raise_event(TicketEvent::Created(TicketCreated {
            ticket_id: id,
            title,
        }));
        Ok(ticket)
    }

    pub fn id_typed(&self) -> TicketId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref()
    }

    pub fn status(&self) -> TicketStatus {
        self.status
    }

    pub fn resolution(&self) -> Option<&str> {
        self.resolution.as_deref()
    }

    /// Change title and description. Raises `ticket.updated` unless nothing changed.
    pub fn update(
        &mut self,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        let title = validate_title(title.into())?;
        let description = description.into();

        if title == self.title && description == self.description {
            return Ok(());
        }

        let old_title = std::mem::replace(&mut self.title, title.clone());
        self.description = description;
        self.raise_event(TicketEvent::Updated(TicketUpdated {
            ticket_id: self.id,
            old_title,
            new_title: title,
        }));
        Ok(())
    }

    /// Assign the ticket. Raises `ticket.assigned` unless already assigned to `assignee`.
    pub fn assign(&mut self, assignee: impl Into<String>) -> DomainResult<()> {
        self.ensure_open()?;
        let assignee = assignee.into().trim().to_string();
        if assignee.is_empty() {
            return Err(DomainError::validation("assignee cannot be empty"));
        }
        if self.assignee.as_deref() == Some(assignee.as_str()) {
            return Ok(());
        }

        let previous_assignee = self.assignee.replace(assignee.clone());
        self.raise_event(TicketEvent::Assigned(TicketAssigned {
            ticket_id: self.id,
            previous_assignee,
            assignee,
        }));
        Ok(())
    }

    /// Close (soft-delete) the ticket. Raises `ticket.closed`.
    pub fn close(&mut self, resolution: impl Into<String>) -> DomainResult<()> {
        if self.status == TicketStatus::Closed {
            return Err(DomainError::conflict("ticket already closed"));
        }
        let resolution = resolution.into();
        self.status = TicketStatus::Closed;
        self.resolution = Some(resolution.clone());
        self.raise_event(TicketEvent::Closed(TicketClosed {
            ticket_id: self.id,
            resolution,
        }));
        Ok(())
    }

    fn ensure_open(&self) -> DomainResult<()> {
        if self.status == TicketStatus::Closed {
            return Err(DomainError::invariant("ticket is closed"));
        }
        Ok(())
    }
}

fn validate_title(title: String) -> DomainResult<String> {
    let title = title.trim().to_string();
    if title.is_empty() {
        return Err(DomainError::validation("title cannot be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(DomainError::validation(format!(
            "title cannot exceed {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title)
}

impl AggregateRoot for Ticket {
    type Id = TicketId;

    fn entity_name() -> &'static str {
        "ticket"
    }

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }
}

impl EventSource for Ticket {
    type Event = TicketEvent;

    fn event_buffer(&self) -> &EventBuffer<TicketEvent> {
        &self.events
    }

    fn event_buffer_mut(&mut self) -> &mut EventBuffer<TicketEvent> {
        &mut self.events
    }
}
