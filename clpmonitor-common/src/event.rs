use serde::{Deserialize, Serialize};

/// A named event fanned out to every live subscriber.
///
/// Events are values in flight: they are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Channel name (e.g., "stock-levels", "clp2-data").
    pub name: String,

    /// The data sent to observers.
    pub payload: EventPayload,
}

impl BroadcastEvent {
    /// Create a new event.
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create an event carrying a single integer.
    pub fn scalar(name: impl Into<String>, id: i32, value: i64) -> Self {
        Self::new(name, EventPayload::new(id, EventValue::Scalar(value)))
    }

    /// Create an event carrying an array of integers.
    pub fn array(name: impl Into<String>, id: i32, values: Vec<i64>) -> Self {
        Self::new(name, EventPayload::new(id, EventValue::Array(values)))
    }
}

/// Payload serialized to observers as `{"id": .., "value": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Source identifier (controller/channel number).
    pub id: i32,

    /// The measured value.
    pub value: EventValue,
}

impl EventPayload {
    pub fn new(id: i32, value: EventValue) -> Self {
        Self { id, value }
    }
}

/// Integer event value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    /// One integer per channel.
    Scalar(i64),

    /// Fixed-length array (colour codes, occupancy flags).
    Array(Vec<i64>),
}

impl EventValue {
    /// Number of integers carried by this value.
    pub fn len(&self) -> usize {
        match self {
            EventValue::Scalar(_) => 1,
            EventValue::Array(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<i64> for EventValue {
    fn from(v: i64) -> Self {
        EventValue::Scalar(v)
    }
}

impl From<Vec<i64>> for EventValue {
    fn from(v: Vec<i64>) -> Self {
        EventValue::Array(v)
    }
}
