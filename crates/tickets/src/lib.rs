//! Support ticket domain module.
//!
//! Tickets are state-stored aggregates that raise domain events for every
//! change; the consumers here react to those events (cache invalidation, audit,
//! assignee notification).

pub mod consumers;
pub mod ticket;

pub use consumers::{
    AssignmentNotifier, AuditRecord, AuditTrail, CacheInvalidator, InMemoryCache,
    OPEN_TICKETS_KEY, ticket_cache_key,
};
pub use ticket::{
    Ticket, TicketAssigned, TicketClosed, TicketCreated, TicketEvent, TicketId, TicketStatus,
    TicketUpdated,
};
