//! Typed rules decoded from persisted records
//!
//! Records carry their conditions and payloads as opaque JSON text. Decoding
//! happens once per snapshot: unknown extra fields are ignored, missing
//! required fields are rejected with the offending rule id. A rule that fails
//! to decode is reported and left out; the rest of the snapshot still loads.
//!
//! Mock action payloads are the one exception: they are decoded when the
//! mock is applied, see [`crate::mock`].

use crate::error::EngineError;
use crate::matcher::{non_empty, MatchMode, MethodPattern, UrlPattern};
use hub_common::{
    BreakpointRuleRecord, ChaosRuleRecord, Direction, MockRuleRecord, Phase, RuleKind, RuleMeta,
    RuleRecord,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use wildmatch::WildMatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MockTarget {
    Http,
    WebSocket,
}

impl MockTarget {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Some(MockTarget::Http),
            "websocket" | "ws" | "wss" => Some(MockTarget::WebSocket),
            _ => None,
        }
    }
}

/// Shape of `mock_rules.condition_json`
#[derive(Debug, Deserialize)]
struct RawMockCondition {
    url_pattern: String,
    #[serde(default)]
    match_mode: MatchMode,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    direction: Option<Direction>,
}

#[derive(Debug, Clone)]
pub struct MockCondition {
    pub url: UrlPattern,
    pub method: Option<MethodPattern>,
    /// Session id wildcard, websocket mocks only
    pub session: Option<WildMatch>,
    /// Frame direction, websocket mocks only
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone)]
pub struct MockRule {
    pub meta: RuleMeta,
    pub target: MockTarget,
    pub condition: MockCondition,
    /// Raw action payload, decoded at apply time
    pub action_json: String,
}

#[derive(Debug, Clone)]
pub struct BreakpointRule {
    pub meta: RuleMeta,
    pub url: Option<UrlPattern>,
    pub method: Option<MethodPattern>,
    pub phase: Phase,
    pub timeout: Option<Duration>,
}

/// Shape of `chaos_rules.chaos_json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChaosFault {
    /// Hold the unit for `delay_ms` plus up to `jitter_ms`
    Latency {
        delay_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
    /// Fail the connection instead of forwarding
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Replace the status of a real response
    Status {
        status_code: u16,
        #[serde(default)]
        body: Option<String>,
    },
    /// Cut the payload down to `keep_bytes`
    Truncate { keep_bytes: usize },
    /// Flip `byte_count` randomly chosen payload bytes
    Corrupt { byte_count: usize },
}

impl ChaosFault {
    pub fn name(&self) -> &'static str {
        match self {
            ChaosFault::Latency { .. } => "latency",
            ChaosFault::Error { .. } => "error",
            ChaosFault::Status { .. } => "status",
            ChaosFault::Truncate { .. } => "truncate",
            ChaosFault::Corrupt { .. } => "corrupt",
        }
    }

    /// Phases this fault can act on
    pub fn acts_on(&self, phase: Phase) -> bool {
        match self {
            ChaosFault::Latency { .. } | ChaosFault::Error { .. } => {
                phase == Phase::Request || phase.is_frame()
            }
            ChaosFault::Status { .. } => phase == Phase::Response,
            ChaosFault::Truncate { .. } | ChaosFault::Corrupt { .. } => {
                phase == Phase::Response || phase.is_frame()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChaosRule {
    pub meta: RuleMeta,
    pub url: Option<UrlPattern>,
    pub method: Option<MethodPattern>,
    pub probability: f64,
    pub fault: ChaosFault,
}

/// A decoded rule of any category
#[derive(Debug, Clone)]
pub enum Rule {
    Mock(MockRule),
    Breakpoint(BreakpointRule),
    Chaos(ChaosRule),
}

impl Rule {
    pub fn compile(record: &RuleRecord) -> Result<Self, EngineError> {
        match record {
            RuleRecord::Mock(r) => MockRule::compile(r).map(Rule::Mock),
            RuleRecord::Breakpoint(r) => BreakpointRule::compile(r).map(Rule::Breakpoint),
            RuleRecord::Chaos(r) => ChaosRule::compile(r).map(Rule::Chaos),
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Mock(_) => RuleKind::Mock,
            Rule::Breakpoint(_) => RuleKind::Breakpoint,
            Rule::Chaos(_) => RuleKind::Chaos,
        }
    }
}

fn compile_url(rule_id: &str, pattern: Option<&str>) -> Result<Option<UrlPattern>, EngineError> {
    pattern
        .map(|p| {
            UrlPattern::parse(p)
                .map_err(|e| EngineError::rule(rule_id, format!("invalid url_pattern '{}': {}", p, e)))
        })
        .transpose()
}

impl MockRule {
    pub fn compile(record: &MockRuleRecord) -> Result<Self, EngineError> {
        let id = &record.meta.id;
        let target = MockTarget::parse(&record.target_type).ok_or_else(|| {
            EngineError::rule(id, format!("unknown target_type '{}'", record.target_type))
        })?;

        let raw: RawMockCondition = serde_json::from_str(&record.condition_json)
            .map_err(|e| EngineError::rule(id, format!("condition_json: {}", e)))?;

        let url = UrlPattern::compile(&raw.url_pattern, raw.match_mode).map_err(|e| {
            EngineError::rule(id, format!("invalid url_pattern '{}': {}", raw.url_pattern, e))
        })?;

        Ok(Self {
            meta: record.meta.clone(),
            target,
            condition: MockCondition {
                url,
                method: non_empty(&raw.method).map(MethodPattern::new),
                session: non_empty(&raw.session_id).map(WildMatch::new),
                direction: raw.direction,
            },
            action_json: record.action_json.clone(),
        })
    }
}

impl BreakpointRule {
    pub fn compile(record: &BreakpointRuleRecord) -> Result<Self, EngineError> {
        let id = &record.meta.id;
        let phase: Phase = record
            .phase
            .parse()
            .map_err(|e| EngineError::rule(id, format!("{}", e)))?;

        Ok(Self {
            meta: record.meta.clone(),
            url: compile_url(id, non_empty(&record.url_pattern))?,
            method: non_empty(&record.method).map(MethodPattern::new),
            phase,
            timeout: record.timeout_ms.map(Duration::from_millis),
        })
    }
}

impl ChaosRule {
    pub fn compile(record: &ChaosRuleRecord) -> Result<Self, EngineError> {
        let id = &record.meta.id;
        if !(0.0..=1.0).contains(&record.probability) {
            return Err(EngineError::rule(
                id,
                format!("probability {} outside 0.0..=1.0", record.probability),
            ));
        }

        let fault: ChaosFault = serde_json::from_str(&record.chaos_json)
            .map_err(|e| EngineError::rule(id, format!("chaos_json: {}", e)))?;
        if let ChaosFault::Status { status_code, .. } = &fault {
            if !(100..=599).contains(status_code) {
                return Err(EngineError::rule(
                    id,
                    format!("status_code {} is not a valid HTTP status", status_code),
                ));
            }
        }

        Ok(Self {
            meta: record.meta.clone(),
            url: compile_url(id, non_empty(&record.url_pattern))?,
            method: non_empty(&record.method).map(MethodPattern::new),
            probability: record.probability,
            fault,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_record(condition_json: &str) -> MockRuleRecord {
        MockRuleRecord {
            meta: RuleMeta::new("m-1", "mock", 1),
            target_type: "http".to_string(),
            condition_json: condition_json.to_string(),
            action_json: r#"{"status_code":200}"#.to_string(),
        }
    }

    fn chaos_record(probability: f64, chaos_json: &str) -> ChaosRuleRecord {
        ChaosRuleRecord {
            meta: RuleMeta::new("c-1", "chaos", 1),
            url_pattern: None,
            method: None,
            probability,
            chaos_json: chaos_json.to_string(),
        }
    }

    #[test]
    fn test_mock_condition_tolerates_unknown_fields() {
        let record = mock_record(r#"{"url_pattern":"/api/*","method":"post","added_in_v2":true}"#);
        let rule = MockRule::compile(&record).unwrap();
        assert_eq!(rule.target, MockTarget::Http);
        assert_eq!(rule.condition.method.as_ref().unwrap().as_str(), "POST");
    }

    #[test]
    fn test_mock_condition_requires_url_pattern() {
        let record = mock_record(r#"{"method":"GET"}"#);
        match MockRule::compile(&record) {
            Err(EngineError::MatchEvaluationError { rule_id, reason }) => {
                assert_eq!(rule_id, "m-1");
                assert!(reason.contains("url_pattern"));
            }
            other => panic!("expected MatchEvaluationError, got {:?}", other),
        }
    }

    #[test]
    fn test_mock_condition_bad_regex() {
        let record = mock_record(r#"{"url_pattern":"[unclosed","match_mode":"regex"}"#);
        assert!(MockRule::compile(&record).is_err());
    }

    #[test]
    fn test_unknown_target_type() {
        let mut record = mock_record(r#"{"url_pattern":"/x"}"#);
        record.target_type = "grpc".to_string();
        assert!(MockRule::compile(&record).is_err());
    }

    #[test]
    fn test_breakpoint_phase_and_empty_columns() {
        let record = BreakpointRuleRecord {
            meta: RuleMeta::new("b-1", "bp", 1),
            url_pattern: Some("".to_string()),
            method: Some("  ".to_string()),
            phase: "response".to_string(),
            timeout_ms: Some(2_000),
        };
        let rule = BreakpointRule::compile(&record).unwrap();
        assert_eq!(rule.phase, Phase::Response);
        assert!(rule.url.is_none());
        assert!(rule.method.is_none());
        assert_eq!(rule.timeout, Some(Duration::from_secs(2)));

        let bad = BreakpointRuleRecord {
            phase: "sometime".to_string(),
            ..record
        };
        assert!(BreakpointRule::compile(&bad).is_err());
    }

    #[test]
    fn test_chaos_fault_decoding() {
        let rule = ChaosRule::compile(&chaos_record(
            0.5,
            r#"{"type":"latency","delay_ms":250,"note":"ignored"}"#,
        ))
        .unwrap();
        assert_eq!(
            rule.fault,
            ChaosFault::Latency {
                delay_ms: 250,
                jitter_ms: 0
            }
        );

        // missing tag and missing variant field are both rejected
        assert!(ChaosRule::compile(&chaos_record(0.5, r#"{"delay_ms":250}"#)).is_err());
        assert!(ChaosRule::compile(&chaos_record(0.5, r#"{"type":"truncate"}"#)).is_err());
        assert!(ChaosRule::compile(&chaos_record(0.5, r#"{"type":"status","status_code":42}"#)).is_err());
    }

    #[test]
    fn test_chaos_probability_range() {
        let json = r#"{"type":"error"}"#;
        assert!(ChaosRule::compile(&chaos_record(0.0, json)).is_ok());
        assert!(ChaosRule::compile(&chaos_record(1.0, json)).is_ok());
        assert!(ChaosRule::compile(&chaos_record(1.5, json)).is_err());
        assert!(ChaosRule::compile(&chaos_record(-0.1, json)).is_err());
        assert!(ChaosRule::compile(&chaos_record(f64::NAN, json)).is_err());
    }

    #[test]
    fn test_fault_phases() {
        let latency = ChaosFault::Latency {
            delay_ms: 1,
            jitter_ms: 0,
        };
        assert!(latency.acts_on(Phase::Request));
        assert!(latency.acts_on(Phase::FrameInbound));
        assert!(!latency.acts_on(Phase::Response));

        let status = ChaosFault::Status {
            status_code: 503,
            body: None,
        };
        assert!(status.acts_on(Phase::Response));
        assert!(!status.acts_on(Phase::Request));

        let corrupt = ChaosFault::Corrupt { byte_count: 1 };
        assert!(corrupt.acts_on(Phase::FrameOutbound));
        assert!(!corrupt.acts_on(Phase::Request));
    }
}
