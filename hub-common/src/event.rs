//! Finalized events handed to the recorder
//!
//! Field layout follows the `http_events`, `ws_frames`, `ws_sessions` and
//! `log_events` tables.

use crate::traffic::{Direction, Headers, HttpExchange, Opcode, WsFrame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters kept in a text frame preview
const PAYLOAD_PREVIEW_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryItem {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEvent {
    pub id: String,
    pub device_id: String,
    pub method: String,
    pub url: String,
    pub query_items: Vec<QueryItem>,
    pub request_headers: Headers,
    #[serde(with = "crate::body")]
    pub request_body: Vec<u8>,
    pub status_code: Option<u16>,
    pub response_headers: Option<Headers>,
    #[serde(with = "crate::body::option")]
    pub response_body: Option<Vec<u8>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end
    pub duration: Option<f64>,
    pub error_description: Option<String>,
    pub is_mocked: bool,
    pub mock_rule_id: Option<String>,
    pub trace_id: Option<String>,
    pub is_favorite: bool,
}

impl HttpEvent {
    /// Build the event for an exchange finishing now.
    pub fn from_exchange(exchange: &HttpExchange) -> Self {
        let end_time = Utc::now();
        let duration = (end_time - exchange.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            id: exchange.id.clone(),
            device_id: exchange.device_id.clone(),
            method: exchange.method.clone(),
            url: exchange.url.clone(),
            query_items: exchange
                .query_items()
                .into_iter()
                .map(|(name, value)| QueryItem { name, value })
                .collect(),
            request_headers: exchange.request_headers.clone(),
            request_body: exchange.request_body.clone(),
            status_code: exchange.response.as_ref().map(|r| r.status_code),
            response_headers: exchange.response.as_ref().map(|r| r.headers.clone()),
            response_body: exchange.response.as_ref().map(|r| r.body.clone()),
            start_time: exchange.started_at,
            end_time: Some(end_time),
            duration: Some(duration),
            error_description: None,
            is_mocked: false,
            mock_rule_id: None,
            trace_id: exchange.trace_id.clone(),
            is_favorite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrameEvent {
    pub id: String,
    pub device_id: String,
    pub session_id: String,
    pub direction: Direction,
    pub opcode: Opcode,
    #[serde(with = "crate::body")]
    pub payload: Vec<u8>,
    pub payload_preview: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_mocked: bool,
    pub mock_rule_id: Option<String>,
}

impl WsFrameEvent {
    pub fn from_frame(frame: &WsFrame) -> Self {
        let payload_preview = match frame.opcode {
            Opcode::Text => Some(
                String::from_utf8_lossy(&frame.payload)
                    .chars()
                    .take(PAYLOAD_PREVIEW_CHARS)
                    .collect(),
            ),
            _ => None,
        };

        Self {
            id: frame.id.clone(),
            device_id: frame.device_id.clone(),
            session_id: frame.session_id.clone(),
            direction: frame.direction,
            opcode: frame.opcode,
            payload: frame.payload.clone(),
            payload_preview,
            timestamp: frame.timestamp,
            is_mocked: false,
            mock_rule_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSessionEvent {
    pub id: String,
    pub device_id: String,
    pub url: String,
    #[serde(default)]
    pub request_headers: Headers,
    #[serde(default)]
    pub subprotocols: Vec<String>,
    pub connect_time: DateTime<Utc>,
    #[serde(default)]
    pub disconnect_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_code: Option<u16>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default = "new_id")]
    pub id: String,
    pub device_id: String,
    /// Where the line came from, e.g. `os_log` or `custom`
    pub source: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub level: String,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub logger_name: Option<String>,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Anything the recorder persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordedEvent {
    Http(HttpEvent),
    WsFrame(WsFrameEvent),
    WsSession(WsSessionEvent),
    Log(LogEvent),
}

impl RecordedEvent {
    pub fn id(&self) -> &str {
        match self {
            RecordedEvent::Http(e) => &e.id,
            RecordedEvent::WsFrame(e) => &e.id,
            RecordedEvent::WsSession(e) => &e.id,
            RecordedEvent::Log(e) => &e.id,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            RecordedEvent::Http(e) => &e.device_id,
            RecordedEvent::WsFrame(e) => &e.device_id,
            RecordedEvent::WsSession(e) => &e.device_id,
            RecordedEvent::Log(e) => &e.device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::HttpResponse;

    #[test]
    fn test_http_event_from_exchange() {
        let exchange = HttpExchange::new("D1", "GET", "https://api.example.com/items?limit=5")
            .with_header("Accept", "application/json")
            .with_response(HttpResponse::new(204));

        let event = HttpEvent::from_exchange(&exchange);
        assert_eq!(event.id, exchange.id);
        assert_eq!(event.status_code, Some(204));
        assert_eq!(
            event.query_items,
            vec![QueryItem {
                name: "limit".to_string(),
                value: "5".to_string()
            }]
        );
        assert!(!event.is_mocked);
        assert!(!event.is_favorite);
        assert!(event.duration.unwrap() >= 0.0);
    }

    #[test]
    fn test_frame_preview_only_for_text() {
        let text = WsFrame::new("D1", "s", "wss://x", Direction::Inbound, Opcode::Text, "x".repeat(300));
        let event = WsFrameEvent::from_frame(&text);
        assert_eq!(event.payload_preview.unwrap().len(), PAYLOAD_PREVIEW_CHARS);

        let binary = WsFrame::new("D1", "s", "wss://x", Direction::Inbound, Opcode::Binary, vec![0u8, 1, 2]);
        assert!(WsFrameEvent::from_frame(&binary).payload_preview.is_none());
    }
}
