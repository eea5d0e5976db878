use std::fmt;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Numeric event type. Its wire topic is `event_<N>`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventType(pub i32);

impl EventType {
    /// Topic string used in subscription requests.
    pub fn topic(self) -> String {
        format!("event_{}", self.0)
    }
}

impl From<i32> for EventType {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Subscribe,
    Unsubscribe,
    BatchSubscribe,
    BatchUnsubscribe,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::BatchSubscribe => "batchSubscribe",
            Method::BatchUnsubscribe => "batchUnsubscribe",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeParams {
    pub topic: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribeParams {
    pub topic: String,
}

/// Parameters shared by `batchSubscribe` and `batchUnsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchParams {
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl SubscribeParams {
    pub fn new(event_type: EventType, offset: u64) -> Self {
        Self {
            topic: event_type.topic(),
            offset,
        }
    }
}

impl UnsubscribeParams {
    pub fn new(event_type: EventType) -> Self {
        Self {
            topic: event_type.topic(),
        }
    }
}

impl BatchParams {
    pub fn new(event_types: &[EventType], offset: Option<u64>) -> Self {
        Self {
            topics: event_types.iter().map(|event_type| event_type.topic()).collect(),
            offset,
        }
    }
}

/// Outbound control request. `id` is unique among in-flight requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMessage {
    pub id: String,
    pub method: Method,
    pub params: serde_json::Value,
}

impl RequestMessage {
    /// Builds a request with a freshly generated id.
    pub fn new<P>(method: Method, params: P) -> Result<Self, serde_json::Error>
    where
        P: Serialize,
    {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            params: serde_json::to_value(params)?,
        })
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseErrorMessage {
    pub code: i64,
    pub message: String,
}

/// Inbound envelope.
///
/// `id` set means a reply to one request; `id` absent or null means an
/// unsolicited push whose `result` is an [`EventMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<ResponseErrorMessage>,
}

impl ResponseMessage {
    /// Successful reply carrying `result`.
    pub fn reply<T>(id: impl Into<String>, result: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self {
            id: Some(id.into()),
            result: Some(serde_json::value::to_raw_value(result)?),
            error: None,
        })
    }

    /// Reply carrying a server-side error object.
    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            result: None,
            error: Some(ResponseErrorMessage {
                code,
                message: message.into(),
            }),
        }
    }

    /// Unsolicited push of an event batch.
    pub fn push(message: &EventMessage) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            result: Some(serde_json::value::to_raw_value(message)?),
            error: None,
        })
    }

    pub fn is_push(&self) -> bool {
        self.id.is_none()
    }

    /// Decodes `result` as a boolean control reply.
    pub fn result_bool(&self) -> Result<bool, serde_json::Error> {
        decode_result(self.result.as_deref())
    }

    /// Decodes `result` as a pushed event batch.
    pub fn event_message(&self) -> Result<EventMessage, serde_json::Error> {
        decode_result(self.result.as_deref())
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn decode_result<T>(result: Option<&RawValue>) -> Result<T, serde_json::Error>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = result.map(RawValue::get).unwrap_or("null");
    serde_json::from_str(raw)
}

/// One domain event. `data` is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub offset: u64,
    pub sender: String,
    pub casino_id: u64,
    pub game_id: u64,
    #[serde(rename = "req_id")]
    pub request_id: u64,
    pub event_type: EventType,
    pub data: Option<Box<RawValue>>,
}

impl Event {
    /// Raw JSON text of the payload, if any.
    pub fn data_json(&self) -> Option<&str> {
        self.data.as_deref().map(RawValue::get)
    }
}

/// Pushed batch of events. `offset` is the last contained event's offset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMessage {
    pub offset: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub events: Vec<Event>,
}

impl EventMessage {
    pub fn new(events: Vec<Event>) -> Self {
        let offset = events.last().map(|event| event.offset).unwrap_or_default();
        Self { offset, events }
    }

    /// Whether `offset` agrees with the last event. Empty batches always do.
    pub fn is_consistent(&self) -> bool {
        self.events
            .last()
            .map_or(true, |event| event.offset == self.offset)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Event>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Event>>::deserialize(deserializer)?.unwrap_or_default())
}
