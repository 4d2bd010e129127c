//! Tag → decoder registry for reading serialized events back.
//!
//! Each domain exposes a closed enum of its event kinds. Outbox rows only carry
//! the type tag and a JSON payload, so the sweeper needs a way back from
//! `(tag, payload)` to the enum. Decoders are plain function pointers registered
//! at startup; an unknown tag is a decode error, not a runtime type lookup.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Decoder for a single event type tag.
pub type DecodeFn<E> = fn(&JsonValue) -> Result<E, serde_json::Error>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder registered for event type '{0}'")]
    UnknownType(String),

    #[error("payload of '{event_type}' could not be decoded: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Registry mapping event type tags to decode functions.
pub struct EventRegistry<E> {
    decoders: BTreeMap<&'static str, DecodeFn<E>>,
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }
}

impl<E> core::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for `event_type`. A later registration for the same
    /// tag replaces the earlier one.
    pub fn register(&mut self, event_type: &'static str, decode: DecodeFn<E>) -> &mut Self {
        self.decoders.insert(event_type, decode);
        self
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub fn decode(&self, event_type: &str, payload: &JsonValue) -> Result<E, DecodeError> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownType(event_type.to_string()))?;

        decode(payload).map_err(|source| DecodeError::Payload {
            event_type: event_type.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    enum Sample {
        Renamed(String),
        Bumped(u32),
    }

    fn registry() -> EventRegistry<Sample> {
        let mut registry = EventRegistry::<Sample>::new();
        registry
            .register("sample.renamed", |v| {
                serde_json::from_value::<String>(v.clone()).map(Sample::Renamed)
            })
            .register("sample.bumped", |v| {
                serde_json::from_value::<u32>(v.clone()).map(Sample::Bumped)
            });
        registry
    }

    #[test]
    fn decodes_by_tag() {
        let registry = registry();
        assert_eq!(
            registry.decode("sample.renamed", &json!("x")).unwrap(),
            Sample::Renamed("x".into())
        );
        assert_eq!(
            registry.decode("sample.bumped", &json!(3)).unwrap(),
            Sample::Bumped(3)
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err = registry().decode("sample.deleted", &json!({})).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(t) if t == "sample.deleted"));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let err = registry().decode("sample.bumped", &json!("nope")).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { event_type, .. } if event_type == "sample.bumped"));
    }

    #[test]
    fn lists_registered_types() {
        let registry = registry();
        assert!(registry.is_registered("sample.bumped"));
        assert_eq!(
            registry.event_types().collect::<Vec<_>>(),
            vec!["sample.bumped", "sample.renamed"]
        );
    }
}
