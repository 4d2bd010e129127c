//! Test fixtures shared by the unit tests of this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use herald_core::{AggregateId, AggregateRoot, ConcurrencyToken};
use herald_events::{Event, EventBuffer, EventRegistry, EventSource};

#[derive(Debug, Clone, PartialEq)]
pub enum CounterEvent {
    Created { name: String },
    Bumped { by: i64 },
    /// Encodes to an error.
    Poisoned,
}

impl CounterEvent {
    pub const CREATED: &'static str = "counter.created";
    pub const BUMPED: &'static str = "counter.bumped";
    pub const POISONED: &'static str = "counter.poisoned";

    pub fn registry() -> EventRegistry<CounterEvent> {
        let mut registry = EventRegistry::<CounterEvent>::new();
        registry
            .register(Self::CREATED, |v| {
                String::deserialize(&v["name"]).map(|name| CounterEvent::Created { name })
            })
            .register(Self::BUMPED, |v| {
                i64::deserialize(&v["by"]).map(|by| CounterEvent::Bumped { by })
            });
        registry
    }
}

impl Event for CounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CounterEvent::Created { .. } => Self::CREATED,
            CounterEvent::Bumped { .. } => Self::BUMPED,
            CounterEvent::Poisoned => Self::POISONED,
        }
    }

    fn encode(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            CounterEvent::Created { name } => Ok(json!({ "name": name })),
            CounterEvent::Bumped { by } => Ok(json!({ "by": by })),
            CounterEvent::Poisoned => Err(<serde_json::Error as serde::ser::Error>::custom(
                "payload cannot be represented",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub id: AggregateId,
    pub name: String,
    pub value: i64,

    #[serde(skip)]
    token: ConcurrencyToken,
    #[serde(skip)]
    events: EventBuffer<CounterEvent>,
}

impl Counter {
    pub fn create(name: &str) -> Self {
        Self::with_id(AggregateId::new(), name)
    }

    pub fn with_id(id: AggregateId, name: &str) -> Self {
        let mut counter = Self {
            id,
            name: name.to_string(),
            value: 0,
            token: ConcurrencyToken::UNSAVED,
            events: EventBuffer::new(),
        };
        counter.raise_event(CounterEvent::Created {
            name: name.to_string(),
        });
        counter
    }

    pub fn bump(&mut self, by: i64) {
        self.value += by;
        self.raise_event(CounterEvent::Bumped { by });
    }

    pub fn poison(&mut self) {
        self.raise_event(CounterEvent::Poisoned);
    }
}

impl AggregateRoot for Counter {
    type Id = AggregateId;

    fn entity_name() -> &'static str {
        "counter"
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

impl EventSource for Counter {
    type Event = CounterEvent;

    fn event_buffer(&self) -> &EventBuffer<CounterEvent> {
        &self.events
    }

    fn event_buffer_mut(&mut self) -> &mut EventBuffer<CounterEvent> {
        &mut self.events
    }
}
