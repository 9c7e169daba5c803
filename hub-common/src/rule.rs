//! Rule records as stored by the persistence layer
//!
//! These mirror the `mock_rules`, `breakpoint_rules` and `chaos_rules`
//! tables. Condition and action columns stay opaque JSON text here; the
//! engine decodes them into typed rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule category. At most one rule per category wins for a traffic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Mock,
    Breakpoint,
    Chaos,
}

impl RuleKind {
    pub const ALL: [RuleKind; 3] = [RuleKind::Mock, RuleKind::Breakpoint, RuleKind::Chaos];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Mock => "mock",
            RuleKind::Breakpoint => "breakpoint",
            RuleKind::Chaos => "chaos",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns shared by every rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMeta {
    pub id: String,
    /// `None` scopes the rule to every device
    #[serde(default)]
    pub device_id: Option<String>,
    pub name: String,
    pub enabled: bool,
    /// Higher wins
    pub priority: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RuleMeta {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            device_id: None,
            name: name.into(),
            enabled: true,
            priority,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this rule may apply to traffic from `device_id`
    pub fn applies_to_device(&self, device_id: &str) -> bool {
        self.device_id.as_deref().map_or(true, |scope| scope == device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRuleRecord {
    #[serde(flatten)]
    pub meta: RuleMeta,
    /// `http` or `websocket`
    pub target_type: String,
    pub condition_json: String,
    pub action_json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointRuleRecord {
    #[serde(flatten)]
    pub meta: RuleMeta,
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub phase: String,
    /// Overrides the configured breakpoint timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosRuleRecord {
    #[serde(flatten)]
    pub meta: RuleMeta,
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Chance of injection per traffic unit, 0.0 to 1.0
    pub probability: f64,
    pub chaos_json: String,
}

/// A row from any of the rule tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleRecord {
    Mock(MockRuleRecord),
    Breakpoint(BreakpointRuleRecord),
    Chaos(ChaosRuleRecord),
}

impl RuleRecord {
    pub fn meta(&self) -> &RuleMeta {
        match self {
            RuleRecord::Mock(r) => &r.meta,
            RuleRecord::Breakpoint(r) => &r.meta,
            RuleRecord::Chaos(r) => &r.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut RuleMeta {
        match self {
            RuleRecord::Mock(r) => &mut r.meta,
            RuleRecord::Breakpoint(r) => &mut r.meta,
            RuleRecord::Chaos(r) => &mut r.meta,
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            RuleRecord::Mock(_) => RuleKind::Mock,
            RuleRecord::Breakpoint(_) => RuleKind::Breakpoint,
            RuleRecord::Chaos(_) => RuleKind::Chaos,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_scope() {
        let global = RuleMeta::new("r1", "all devices", 1);
        assert!(global.applies_to_device("D1"));
        assert!(global.applies_to_device("D2"));

        let scoped = RuleMeta::new("r2", "only D1", 1).for_device("D1");
        assert!(scoped.applies_to_device("D1"));
        assert!(!scoped.applies_to_device("D2"));
    }

    #[test]
    fn test_record_json_with_unknown_columns() {
        let json = r#"{
            "kind": "chaos",
            "id": "c-1",
            "device_id": "D1",
            "name": "slow api",
            "enabled": true,
            "priority": 3,
            "url_pattern": "/api/**",
            "probability": 0.25,
            "chaos_json": "{\"type\":\"latency\",\"delay_ms\":100}",
            "legacy_column": "ignored"
        }"#;
        let record: RuleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind(), RuleKind::Chaos);
        assert_eq!(record.id(), "c-1");
        assert_eq!(record.meta().priority, 3);
        match record {
            RuleRecord::Chaos(chaos) => {
                assert_eq!(chaos.probability, 0.25);
                assert_eq!(chaos.method, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_record_json_missing_required_column() {
        let json = r#"{
            "kind": "breakpoint",
            "id": "b-1",
            "name": "no phase",
            "enabled": true,
            "priority": 1
        }"#;
        let err = serde_json::from_str::<RuleRecord>(json).unwrap_err();
        assert!(err.to_string().contains("phase"));
    }
}
