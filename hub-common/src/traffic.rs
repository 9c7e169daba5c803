//! Intercepted traffic units
//!
//! A traffic unit is one HTTP exchange (seen at its request or response
//! phase) or one WebSocket frame. The transport layer builds these and hands
//! them to the interception engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Header map used across requests, responses and recorded events
pub type Headers = HashMap<String, String>;

/// Point in a unit's life at which rules are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Request,
    Response,
    FrameOutbound,
    FrameInbound,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
            Phase::FrameOutbound => "frame-outbound",
            Phase::FrameInbound => "frame-inbound",
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Phase::FrameOutbound | Phase::FrameInbound)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored phase string is not one we know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl fmt::Display for UnknownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown phase '{}'", self.0)
    }
}

impl std::error::Error for UnknownPhase {}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "request" => Ok(Phase::Request),
            "response" => Ok(Phase::Response),
            "frame-outbound" | "outbound" => Ok(Phase::FrameOutbound),
            "frame-inbound" | "inbound" => Ok(Phase::FrameInbound),
            _ => Err(UnknownPhase(s.to_string())),
        }
    }
}

/// WebSocket frame direction, seen from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to server
    Outbound,
    /// Server to device
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
    Continuation,
}

impl Opcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
            Opcode::Close => "close",
            Opcode::Continuation => "continuation",
        }
    }
}

/// Response half of an HTTP exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "crate::body")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// One HTTP request/response pair
///
/// The exchange is at the request phase while `response` is empty and at the
/// response phase once the transport has filled it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpExchange {
    #[serde(default = "new_id")]
    pub id: String,
    pub device_id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_headers: Headers,
    #[serde(default, with = "crate::body")]
    pub request_body: Vec<u8>,
    #[serde(default)]
    pub response: Option<HttpResponse>,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl HttpExchange {
    pub fn new(
        device_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            device_id: device_id.into(),
            trace_id: None,
            method: method.into(),
            url: url.into(),
            request_headers: Headers::new(),
            request_body: Vec::new(),
            response: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request_body = body.into();
        self
    }

    pub fn with_response(mut self, response: HttpResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn phase(&self) -> Phase {
        if self.response.is_some() {
            Phase::Response
        } else {
            Phase::Request
        }
    }

    /// Path component of the URL. Relative URLs are returned without query.
    pub fn path(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => self
                .url
                .split(|c: char| c == '?' || c == '#')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Decoded query parameters, in order of appearance
    pub fn query_items(&self) -> Vec<(String, String)> {
        let query = match url::Url::parse(&self.url) {
            Ok(parsed) => parsed.query().map(str::to_string),
            Err(_) => self
                .url
                .split_once('?')
                .map(|(_, q)| q.split('#').next().unwrap_or_default().to_string()),
        };
        match query {
            Some(q) => url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Case-insensitive request header lookup
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(default = "new_id")]
    pub id: String,
    pub device_id: String,
    pub session_id: String,
    /// URL the session was opened against
    pub session_url: String,
    pub direction: Direction,
    pub opcode: Opcode,
    #[serde(default, with = "crate::body")]
    pub payload: Vec<u8>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WsFrame {
    pub fn new(
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        session_url: impl Into<String>,
        direction: Direction,
        opcode: Opcode,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: new_id(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            session_url: session_url.into(),
            direction,
            opcode,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.direction {
            Direction::Outbound => Phase::FrameOutbound,
            Direction::Inbound => Phase::FrameInbound,
        }
    }
}

/// Anything the engine can be asked to arbitrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficUnit {
    Http(HttpExchange),
    Frame(WsFrame),
}

impl TrafficUnit {
    pub fn id(&self) -> &str {
        match self {
            TrafficUnit::Http(exchange) => &exchange.id,
            TrafficUnit::Frame(frame) => &frame.id,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            TrafficUnit::Http(exchange) => &exchange.device_id,
            TrafficUnit::Frame(frame) => &frame.device_id,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            TrafficUnit::Http(exchange) => exchange.phase(),
            TrafficUnit::Frame(frame) => frame.phase(),
        }
    }

    /// Request URL for HTTP, session URL for frames
    pub fn url(&self) -> &str {
        match self {
            TrafficUnit::Http(exchange) => &exchange.url,
            TrafficUnit::Frame(frame) => &frame.session_url,
        }
    }

    /// HTTP method; frames have none
    pub fn method(&self) -> Option<&str> {
        match self {
            TrafficUnit::Http(exchange) => Some(&exchange.method),
            TrafficUnit::Frame(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            TrafficUnit::Http(_) => None,
            TrafficUnit::Frame(frame) => Some(&frame.session_id),
        }
    }

    /// The payload rules act on at the current phase: request body, response
    /// body, or frame payload.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        match self {
            TrafficUnit::Http(exchange) => match exchange.response.as_mut() {
                Some(response) => &mut response.body,
                None => &mut exchange.request_body,
            },
            TrafficUnit::Frame(frame) => &mut frame.payload,
        }
    }

    pub fn as_http(&self) -> Option<&HttpExchange> {
        match self {
            TrafficUnit::Http(exchange) => Some(exchange),
            TrafficUnit::Frame(_) => None,
        }
    }

    pub fn as_frame(&self) -> Option<&WsFrame> {
        match self {
            TrafficUnit::Http(_) => None,
            TrafficUnit::Frame(frame) => Some(frame),
        }
    }
}

impl From<HttpExchange> for TrafficUnit {
    fn from(exchange: HttpExchange) -> Self {
        TrafficUnit::Http(exchange)
    }
}

impl From<WsFrame> for TrafficUnit {
    fn from(frame: WsFrame) -> Self {
        TrafficUnit::Frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parsing() {
        assert_eq!("request".parse::<Phase>().unwrap(), Phase::Request);
        assert_eq!("RESPONSE".parse::<Phase>().unwrap(), Phase::Response);
        assert_eq!("frame_outbound".parse::<Phase>().unwrap(), Phase::FrameOutbound);
        assert_eq!("frame-inbound".parse::<Phase>().unwrap(), Phase::FrameInbound);
        assert!("midway".parse::<Phase>().is_err());
    }

    #[test]
    fn test_exchange_phase_follows_response() {
        let exchange = HttpExchange::new("D1", "GET", "https://api.example.com/users");
        assert_eq!(exchange.phase(), Phase::Request);

        let exchange = exchange.with_response(HttpResponse::new(200));
        assert_eq!(exchange.phase(), Phase::Response);
    }

    #[test]
    fn test_path_and_query_items() {
        let exchange = HttpExchange::new("D1", "GET", "https://api.example.com/search?q=rust%20lang&page=2");
        assert_eq!(exchange.path(), "/search");
        assert_eq!(
            exchange.query_items(),
            vec![
                ("q".to_string(), "rust lang".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );

        let relative = HttpExchange::new("D1", "GET", "/api/login?next=home");
        assert_eq!(relative.path(), "/api/login");
        assert_eq!(relative.query_items(), vec![("next".to_string(), "home".to_string())]);
    }

    #[test]
    fn test_payload_mut_targets_current_phase() {
        let mut unit = TrafficUnit::Http(HttpExchange::new("D1", "POST", "/upload").with_body("req"));
        unit.payload_mut().push(b'!');
        assert_eq!(unit.as_http().unwrap().request_body, b"req!");

        let mut unit = TrafficUnit::Http(
            HttpExchange::new("D1", "GET", "/page").with_response(HttpResponse::new(200).with_body("res")),
        );
        unit.payload_mut().clear();
        let exchange = unit.as_http().unwrap();
        assert!(exchange.response.as_ref().unwrap().body.is_empty());
        assert!(exchange.request_body.is_empty());
    }

    #[test]
    fn test_unit_json_shape() {
        let json = r#"{
            "kind": "frame",
            "device_id": "D1",
            "session_id": "s-1",
            "session_url": "wss://chat.example.com/socket",
            "direction": "inbound",
            "opcode": "text",
            "payload": "aGVsbG8="
        }"#;
        let unit: TrafficUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.phase(), Phase::FrameInbound);
        assert_eq!(unit.as_frame().unwrap().payload, b"hello");
        assert!(!unit.id().is_empty());
    }
}
