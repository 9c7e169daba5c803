//! Mock execution
//!
//! HTTP mocks synthesize a response and the backend is never contacted.
//! WebSocket mocks replace the frame payload. Action payloads are decoded
//! here, per application, so a malformed action only affects the units it
//! wins for.

use crate::error::EngineError;
use crate::rules::MockRule;
use crate::Result;
use base64::Engine;
use hub_common::{Headers, HttpExchange, HttpResponse, Opcode, TrafficUnit, WsFrame};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

lazy_static::lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap();
}

/// Shape of an HTTP `action_json`
#[derive(Debug, Clone, Deserialize)]
pub struct HttpMockAction {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    /// Template text, see [`render_template`]
    #[serde(default)]
    pub body: Option<String>,
    /// Raw body bytes; wins over `body` when both are set
    #[serde(default)]
    pub body_base64: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// Shape of a WebSocket `action_json`
#[derive(Debug, Clone, Deserialize)]
pub struct FrameMockAction {
    pub payload: String,
    #[serde(default)]
    pub opcode: Option<Opcode>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MockOutcome {
    /// The unit after the mock; frames carry the replaced payload
    pub unit: TrafficUnit,
    /// Synthetic response for HTTP mocks
    pub response: Option<HttpResponse>,
    /// Wait before the result is released
    pub delay: Option<Duration>,
}

fn malformed(rule: &MockRule, reason: impl Into<String>) -> EngineError {
    EngineError::MalformedMockPayload {
        rule_id: rule.meta.id.clone(),
        reason: reason.into(),
    }
}

/// Execute the winning mock for `unit`. On error the caller still holds the
/// untouched unit.
pub fn apply_mock(rule: &MockRule, unit: &TrafficUnit) -> Result<MockOutcome> {
    match unit {
        TrafficUnit::Http(exchange) => {
            let action: HttpMockAction = serde_json::from_str(&rule.action_json)
                .map_err(|e| malformed(rule, e.to_string()))?;
            let response = build_response(rule, &action, exchange)?;
            info!(
                rule_id = %rule.meta.id,
                unit_id = %exchange.id,
                status = response.status_code,
                "Serving mock response"
            );
            Ok(MockOutcome {
                unit: unit.clone(),
                response: Some(response),
                delay: action.delay_ms.map(Duration::from_millis),
            })
        }
        TrafficUnit::Frame(frame) => {
            let action: FrameMockAction = serde_json::from_str(&rule.action_json)
                .map_err(|e| malformed(rule, e.to_string()))?;
            let payload = render_template(&action.payload, |key| frame_value(frame, key));
            let mut frame = frame.clone();
            frame.payload = payload.into_bytes();
            frame.opcode = action.opcode.unwrap_or(Opcode::Text);
            info!(rule_id = %rule.meta.id, unit_id = %frame.id, "Replaced frame payload");
            Ok(MockOutcome {
                unit: TrafficUnit::Frame(frame),
                response: None,
                delay: action.delay_ms.map(Duration::from_millis),
            })
        }
    }
}

fn build_response(
    rule: &MockRule,
    action: &HttpMockAction,
    exchange: &HttpExchange,
) -> Result<HttpResponse> {
    if !(100..=599).contains(&action.status_code) {
        return Err(malformed(
            rule,
            format!("status_code {} is not a valid HTTP status", action.status_code),
        ));
    }

    let body = match (&action.body_base64, &action.body) {
        (Some(encoded), _) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| malformed(rule, format!("body_base64: {}", e)))?,
        (None, Some(template)) => render_template(template, |key| exchange_value(exchange, key)).into_bytes(),
        (None, None) => Vec::new(),
    };

    let mut response = HttpResponse::new(action.status_code).with_body(body);
    response.headers = action.headers.clone();
    Ok(response)
}

/// Substitute `{{name}}` placeholders. Unknown names are left as written.
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn exchange_value(exchange: &HttpExchange, key: &str) -> Option<String> {
    match key {
        "method" => Some(exchange.method.clone()),
        "url" => Some(exchange.url.clone()),
        "path" => Some(exchange.path()),
        "device_id" => Some(exchange.device_id.clone()),
        "request_id" => Some(exchange.id.clone()),
        "trace_id" => exchange.trace_id.clone(),
        _ => {
            if let Some(name) = key.strip_prefix("query.") {
                exchange
                    .query_items()
                    .into_iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v)
            } else if let Some(name) = key.strip_prefix("header.") {
                exchange.request_header(name).map(str::to_string)
            } else {
                None
            }
        }
    }
}

fn frame_value(frame: &WsFrame, key: &str) -> Option<String> {
    match key {
        "url" => Some(frame.session_url.clone()),
        "device_id" => Some(frame.device_id.clone()),
        "session_id" => Some(frame.session_id.clone()),
        "request_id" => Some(frame.id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::{Direction, MockRuleRecord, RuleMeta};

    fn rule(target: &str, action_json: &str) -> MockRule {
        MockRule::compile(&MockRuleRecord {
            meta: RuleMeta::new("mock-1", "mock", 1),
            target_type: target.to_string(),
            condition_json: r#"{"url_pattern":"**"}"#.to_string(),
            action_json: action_json.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_http_mock_renders_template() {
        let rule = rule(
            "http",
            r#"{
                "status_code": 201,
                "headers": {"Content-Type": "application/json"},
                "body": "{\"user\":\"{{query.user}}\",\"path\":\"{{path}}\",\"ua\":\"{{ header.user-agent }}\",\"x\":\"{{nope}}\"}",
                "delay_ms": 150
            }"#,
        );
        let exchange = HttpExchange::new("D1", "GET", "https://api.example.com/api/me?user=ada")
            .with_header("User-Agent", "DebugHub/1.0");

        let outcome = apply_mock(&rule, &exchange.into()).unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.headers["Content-Type"], "application/json");
        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            r#"{"user":"ada","path":"/api/me","ua":"DebugHub/1.0","x":"{{nope}}"}"#
        );
        assert_eq!(outcome.delay, Some(Duration::from_millis(150)));
        // the request itself is untouched
        assert!(outcome.unit.as_http().unwrap().response.is_none());
    }

    #[test]
    fn test_http_mock_base64_body() {
        let rule = rule("http", r#"{"status_code":200,"body":"ignored","body_base64":"AAEC"}"#);
        let outcome = apply_mock(&rule, &HttpExchange::new("D1", "GET", "/bin").into()).unwrap();
        assert_eq!(outcome.response.unwrap().body, vec![0u8, 1, 2]);
    }

    #[test]
    fn test_malformed_action() {
        for action in [
            r#"{"headers":{}}"#,
            r#"{"status_code":"two hundred"}"#,
            r#"{"status_code":999}"#,
            r#"{"status_code":200,"body_base64":"%%%"}"#,
            "not json",
        ] {
            let rule = rule("http", action);
            let err = apply_mock(&rule, &HttpExchange::new("D1", "GET", "/x").into()).unwrap_err();
            assert!(
                matches!(err, EngineError::MalformedMockPayload { ref rule_id, .. } if rule_id == "mock-1"),
                "action {} gave {:?}",
                action,
                err
            );
        }
    }

    #[test]
    fn test_frame_mock_replaces_payload() {
        let rule = rule("websocket", r#"{"payload":"hello {{session_id}}","unknown":1}"#);
        let frame = WsFrame::new(
            "D1",
            "s-9",
            "wss://chat.example.com/socket",
            Direction::Inbound,
            Opcode::Binary,
            vec![9u8; 4],
        );

        let outcome = apply_mock(&rule, &frame.into()).unwrap();
        let frame = outcome.unit.as_frame().unwrap();
        assert_eq!(frame.payload, b"hello s-9");
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(outcome.response.is_none());
        assert!(outcome.delay.is_none());
    }
}
