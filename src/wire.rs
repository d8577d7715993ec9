//! Engine.IO / Socket.IO text frame codec
//!
//! A backend text frame is laid out as
//!
//! ```text
//! <packet digit>[<event digit>[<attachments>-][<namespace>,][<id>]]<payload>
//! ```
//!
//! where only the `message` packet type carries the bracketed socket layer.
//! `420["getJoinData"]` is a message (4) holding an event (2) with id 0;
//! `430[{...}]` is the matching acknowledgement.

use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Outer (transport) packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl PacketType {
    fn from_digit(digit: u8) -> Option<Self> {
        Some(match digit {
            b'0' => PacketType::Open,
            b'1' => PacketType::Close,
            b'2' => PacketType::Ping,
            b'3' => PacketType::Pong,
            b'4' => PacketType::Message,
            b'5' => PacketType::Upgrade,
            b'6' => PacketType::Noop,
            _ => return None,
        })
    }

    fn digit(self) -> char {
        match self {
            PacketType::Open => '0',
            PacketType::Close => '1',
            PacketType::Ping => '2',
            PacketType::Pong => '3',
            PacketType::Message => '4',
            PacketType::Upgrade => '5',
            PacketType::Noop => '6',
        }
    }
}

/// Inner (socket) packet type carried by a `Message` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl EventType {
    fn from_digit(digit: u8) -> Option<Self> {
        Some(match digit {
            b'0' => EventType::Connect,
            b'1' => EventType::Disconnect,
            b'2' => EventType::Event,
            b'3' => EventType::Ack,
            b'4' => EventType::ConnectError,
            b'5' => EventType::BinaryEvent,
            b'6' => EventType::BinaryAck,
            _ => return None,
        })
    }

    fn digit(self) -> char {
        match self {
            EventType::Connect => '0',
            EventType::Disconnect => '1',
            EventType::Event => '2',
            EventType::Ack => '3',
            EventType::ConnectError => '4',
            EventType::BinaryEvent => '5',
            EventType::BinaryAck => '6',
        }
    }

    fn is_binary(self) -> bool {
        matches!(self, EventType::BinaryEvent | EventType::BinaryAck)
    }

    pub fn is_request(self) -> bool {
        matches!(self, EventType::Event | EventType::BinaryEvent)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, EventType::Ack | EventType::BinaryAck)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Json(Value),
    /// Non-JSON transport payloads such as `probe`
    Raw(String),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub packet: PacketType,
    pub event: Option<EventType>,
    pub attachments: Option<u32>,
    pub namespace: Option<String>,
    pub id: Option<u64>,
    pub payload: Payload,
}

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownPacket(char),
    #[error("malformed {0} field")]
    Malformed(&'static str),
    #[error("invalid JSON payload: {0}")]
    Payload(String),
}

impl WireMessage {
    /// A bare transport packet with no payload (`2`, `3`, ...)
    pub fn packet(packet: PacketType) -> Self {
        Self {
            packet,
            event: None,
            attachments: None,
            namespace: None,
            id: None,
            payload: Payload::None,
        }
    }

    /// A socket-layer message on the default namespace
    pub fn message(event: EventType, id: Option<u64>, payload: Payload) -> Self {
        Self {
            packet: PacketType::Message,
            event: Some(event),
            attachments: None,
            namespace: None,
            id,
            payload,
        }
    }

    /// The JSON array carried by an event or ack
    pub fn data(&self) -> Option<&Vec<Value>> {
        match &self.payload {
            Payload::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.payload {
            Payload::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn is_event_with_id(&self) -> bool {
        self.packet == PacketType::Message
            && self.event.is_some_and(EventType::is_request)
            && self.id.is_some()
    }

    pub fn is_ack(&self) -> bool {
        self.packet == PacketType::Message && self.event.is_some_and(EventType::is_reply)
    }
}

/// Read a run of ASCII digits starting at `pos`
fn take_digits(bytes: &[u8], pos: usize) -> (usize, Option<u64>, bool) {
    let end = bytes[pos..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |offset| pos + offset);
    if end == pos {
        return (pos, None, true);
    }
    // Digits are ASCII so the slice is valid UTF-8
    let text = std::str::from_utf8(&bytes[pos..end]).unwrap_or_default();
    match text.parse::<u64>() {
        Ok(value) => (end, Some(value), true),
        Err(_) => (end, None, false),
    }
}

fn decode_payload(rest: &str) -> Result<Payload, WireError> {
    if rest.is_empty() {
        return Ok(Payload::None);
    }
    serde_json::from_str(rest)
        .map(Payload::Json)
        .map_err(|e| WireError::Payload(e.to_string()))
}

/// Decode one text frame
pub fn decode(frame: &str) -> Result<WireMessage, WireError> {
    let bytes = frame.as_bytes();
    let first = *bytes.first().ok_or(WireError::Empty)?;
    let packet = PacketType::from_digit(first)
        .ok_or_else(|| WireError::UnknownPacket(frame.chars().next().unwrap_or('?')))?;

    let mut message = WireMessage::packet(packet);

    if packet != PacketType::Message {
        let rest = &frame[1..];
        if !rest.is_empty() {
            message.payload = match packet {
                PacketType::Open => decode_payload(rest)?,
                _ => Payload::Raw(rest.to_string()),
            };
        }
        return Ok(message);
    }

    let Some(event) = bytes.get(1).and_then(|b| EventType::from_digit(*b)) else {
        // Transport-level message with no socket layer
        if frame.len() > 1 {
            message.payload = Payload::Raw(frame[1..].to_string());
        }
        return Ok(message);
    };
    message.event = Some(event);

    let mut pos = 2;

    if event.is_binary() {
        let (end, count, ok) = take_digits(bytes, pos);
        if !ok || count.is_none() || bytes.get(end) != Some(&b'-') {
            return Err(WireError::Malformed("attachments"));
        }
        message.attachments = count.map(|c| c as u32);
        pos = end + 1;
    }

    if bytes.get(pos) == Some(&b'/') {
        match frame[pos..].find(',') {
            Some(comma) => {
                message.namespace = Some(frame[pos..pos + comma].to_string());
                pos += comma + 1;
            }
            None => {
                message.namespace = Some(frame[pos..].to_string());
                return Ok(message);
            }
        }
    }

    let (end, id, ok) = take_digits(bytes, pos);
    if !ok {
        return Err(WireError::Malformed("id"));
    }
    message.id = id;

    message.payload = decode_payload(&frame[end..])?;
    Ok(message)
}

/// Encode a frame back into its text form
pub fn encode(message: &WireMessage) -> String {
    let mut out = String::new();
    out.push(message.packet.digit());

    if let Some(event) = message.event {
        out.push(event.digit());
        if let Some(count) = message.attachments {
            out.push_str(&count.to_string());
            out.push('-');
        }
        if let Some(namespace) = &message.namespace {
            out.push_str(namespace);
            out.push(',');
        }
        if let Some(id) = message.id {
            out.push_str(&id.to_string());
        }
    }

    match &message.payload {
        Payload::None => {}
        Payload::Json(value) => out.push_str(&value.to_string()),
        Payload::Raw(text) => out.push_str(text),
    }
    out
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

/// Default number of outstanding client requests remembered per connection
pub const DEFAULT_WINDOW: usize = 64;

/// Pairs server replies with the client requests they answer.
///
/// A reply with id `m` answers the request whose id is `m - offset`.
#[derive(Debug)]
pub struct Correlator {
    offset: i64,
    capacity: usize,
    pending: VecDeque<(u64, Vec<Value>)>,
}

impl Correlator {
    pub fn new(offset: i64) -> Self {
        Self::with_capacity(offset, DEFAULT_WINDOW)
    }

    pub fn with_capacity(offset: i64, capacity: usize) -> Self {
        Self {
            offset,
            capacity: capacity.max(1),
            pending: VecDeque::new(),
        }
    }

    /// Remember a client-to-server event that expects a reply
    pub fn record(&mut self, message: &WireMessage) {
        if !message.is_event_with_id() {
            return;
        }
        let (Some(id), Some(data)) = (message.id, message.data()) else {
            return;
        };
        self.pending.retain(|(pending, _)| *pending != id);
        if self.pending.len() == self.capacity {
            self.pending.pop_front();
        }
        self.pending.push_back((id, data.clone()));
    }

    /// Take the request data answered by a server-to-client ack
    pub fn resolve(&mut self, message: &WireMessage) -> Option<Vec<Value>> {
        if !message.is_ack() {
            return None;
        }
        let reply_id = i128::from(message.id?);
        let request_id = u64::try_from(reply_id - i128::from(self.offset)).ok()?;
        let index = self.pending.iter().position(|(id, _)| *id == request_id)?;
        self.pending.remove(index).map(|(_, data)| data)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
