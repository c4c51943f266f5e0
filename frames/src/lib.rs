//! Shared frame model and JSON codec for the host/client message channel.
//!
//! This crate owns the wire representation used by both ends of a transport.
//! Every frame is a JSON array `[channel_id, frame_type, payload, error]`.
//! Decoding validates the tuple shape and lifts the payload into a typed
//! [`Body`], so neither the host router nor the client channel ever touches
//! raw tuples.

mod name;

pub use name::{ConnectionName, ConnectionType, NameError, PROTOCOL};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not valid JSON.
    #[error("failed to parse frame json: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON value is not an array.
    #[error("frame is not a json array")]
    NotArray,
    /// The array is neither the 3-tuple nor the 4-tuple shape.
    #[error("frame has {0} elements, expected 3 or 4")]
    Arity(usize),
    /// The first element is not a string.
    #[error("frame channel id is not a string")]
    InvalidChannelId,
    /// The second element does not map to a known [`FrameType`].
    #[error("invalid frame type: {0}")]
    InvalidFrameType(Value),
    /// The payload does not match what the frame type requires.
    #[error("invalid {frame_type:?} payload: {reason}")]
    InvalidPayload { frame_type: FrameType, reason: String },
    /// The error slot holds something other than a string or null.
    #[error("frame error slot is not a string")]
    InvalidError,
    /// A data frame arrived with the reserved empty channel id.
    #[error("{0:?} frame is missing its channel id")]
    MissingChannelId(FrameType),
    /// A control frame arrived with a non-empty channel id.
    #[error("control frame carries channel id `{0}`")]
    ControlChannelId(String),
}

/// Kind of frame on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Channel-less protocol signal (`ack` handshake, `refresh`).
    Control,
    /// Fire-and-forget message, completed by an [`FrameType::Ack`].
    Send,
    /// Receipt for a send or request.
    Ack,
    /// Message expecting a [`FrameType::Response`].
    Request,
    /// Terminal answer to a request.
    Response,
}

impl FrameType {
    /// Wire integer for this frame type.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Control => 1,
            Self::Send => 2,
            Self::Ack => 3,
            Self::Request => 4,
            Self::Response => 5,
        }
    }

    fn from_wire(value: &Value) -> Result<Self, CodecError> {
        match value.as_u64() {
            Some(1) => Ok(Self::Control),
            Some(2) => Ok(Self::Send),
            Some(3) => Ok(Self::Ack),
            Some(4) => Ok(Self::Request),
            Some(5) => Ok(Self::Response),
            _ => Err(CodecError::InvalidFrameType(value.clone())),
        }
    }
}

/// Typed application message carried by SEND and REQUEST frames.
///
/// The channel never interprets `value`; `kind` selects the host handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl Message {
    #[must_use]
    pub fn new(kind: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }
}

/// Purpose of a CONTROL frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// Host greeting sent once per accepted connection.
    Ack,
    /// Host is about to rotate; the client should reconnect.
    Refresh,
    /// Anything else. Decoded so receivers can log it as unroutable.
    Other(String),
}

impl Control {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ack => "ack",
            Self::Refresh => "refresh",
            Self::Other(kind) => kind,
        }
    }

    fn from_kind(kind: &str) -> Self {
        match kind {
            "ack" => Self::Ack,
            "refresh" => Self::Refresh,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Frame contents, keyed by frame type.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Control(Control),
    Send(Message),
    Ack,
    Request(Message),
    /// Handler return value, or the error string the host reported.
    Response(Result<Value, String>),
}

/// A single message on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Empty for control frames, otherwise the exchange identifier.
    pub channel_id: String,
    pub body: Body,
}

impl Frame {
    #[must_use]
    pub fn control(control: Control) -> Self {
        Self { channel_id: String::new(), body: Body::Control(control) }
    }

    /// The `ack` greeting the host sends right after accepting a connection.
    #[must_use]
    pub fn handshake() -> Self {
        Self::control(Control::Ack)
    }

    #[must_use]
    pub fn refresh() -> Self {
        Self::control(Control::Refresh)
    }

    #[must_use]
    pub fn send(channel_id: impl Into<String>, message: Message) -> Self {
        Self { channel_id: channel_id.into(), body: Body::Send(message) }
    }

    #[must_use]
    pub fn request(channel_id: impl Into<String>, message: Message) -> Self {
        Self { channel_id: channel_id.into(), body: Body::Request(message) }
    }

    #[must_use]
    pub fn ack(channel_id: impl Into<String>) -> Self {
        Self { channel_id: channel_id.into(), body: Body::Ack }
    }

    #[must_use]
    pub fn response(channel_id: impl Into<String>, result: Result<Value, String>) -> Self {
        Self { channel_id: channel_id.into(), body: Body::Response(result) }
    }

    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            Body::Control(_) => FrameType::Control,
            Body::Send(_) => FrameType::Send,
            Body::Ack => FrameType::Ack,
            Body::Request(_) => FrameType::Request,
            Body::Response(_) => FrameType::Response,
        }
    }
}

/// Encode a frame into its JSON array text.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    frame_to_wire(frame).to_string()
}

/// Decode JSON text into a validated frame.
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first shape or payload violation.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    wire_to_frame(value)
}

fn frame_to_wire(frame: &Frame) -> Value {
    let (payload, error) = match &frame.body {
        Body::Control(control) => (typed_object(control.as_str(), None), Value::Null),
        Body::Send(message) | Body::Request(message) => {
            (typed_object(&message.kind, Some(&message.value)), Value::Null)
        }
        Body::Ack => (Value::Null, Value::Null),
        Body::Response(Ok(value)) => (value.clone(), Value::Null),
        Body::Response(Err(message)) => (Value::Null, Value::String(message.clone())),
    };

    Value::Array(vec![
        Value::String(frame.channel_id.clone()),
        Value::from(frame.frame_type().as_u8()),
        payload,
        error,
    ])
}

fn typed_object(kind: &str, value: Option<&Value>) -> Value {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(kind.to_owned()));
    if let Some(value) = value {
        map.insert("value".into(), value.clone());
    }
    Value::Object(map)
}

fn wire_to_frame(value: Value) -> Result<Frame, CodecError> {
    let Value::Array(parts) = value else {
        return Err(CodecError::NotArray);
    };
    if !(3..=4).contains(&parts.len()) {
        return Err(CodecError::Arity(parts.len()));
    }

    let mut parts = parts.into_iter();
    let channel_id = parts.next().unwrap_or(Value::Null);
    let frame_type = FrameType::from_wire(&parts.next().unwrap_or(Value::Null))?;
    let payload = parts.next().unwrap_or(Value::Null);
    let error = parts.next().unwrap_or(Value::Null);

    let Value::String(channel_id) = channel_id else {
        return Err(CodecError::InvalidChannelId);
    };

    let body = match frame_type {
        FrameType::Control => {
            if !channel_id.is_empty() {
                return Err(CodecError::ControlChannelId(channel_id));
            }
            Body::Control(parse_control(&payload)?)
        }
        _ if channel_id.is_empty() => return Err(CodecError::MissingChannelId(frame_type)),
        FrameType::Send => Body::Send(parse_message(frame_type, payload)?),
        FrameType::Request => Body::Request(parse_message(frame_type, payload)?),
        FrameType::Ack => Body::Ack,
        FrameType::Response => match error {
            Value::Null => Body::Response(Ok(payload)),
            Value::String(message) => Body::Response(Err(message)),
            _ => return Err(CodecError::InvalidError),
        },
    };

    Ok(Frame { channel_id, body })
}

fn parse_control(payload: &Value) -> Result<Control, CodecError> {
    payload
        .get("type")
        .and_then(Value::as_str)
        .map(Control::from_kind)
        .ok_or_else(|| CodecError::InvalidPayload {
            frame_type: FrameType::Control,
            reason: "control payload needs a string `type`".to_owned(),
        })
}

fn parse_message(frame_type: FrameType, payload: Value) -> Result<Message, CodecError> {
    serde_json::from_value(payload).map_err(|e| CodecError::InvalidPayload {
        frame_type,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
