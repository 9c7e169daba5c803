//! Conflict resolution between overlapping rules
//!
//! Each category is arbitrated on its own: among the rules that match the
//! unit and are still live, the one with the highest priority wins, ties
//! going to the smallest id. The engine then executes the winners in a fixed
//! order: breakpoint, mock, chaos, pass-through.

use crate::matcher::{self, Matchable};
use crate::rules::{BreakpointRule, ChaosRule, MockRule};
use crate::store::{priority_order, RuleSnapshot, RuleStore};
use chrono::{DateTime, Utc};
use hub_common::{HttpResponse, TrafficUnit};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tracing::debug;

/// Whether a rule taken from a snapshot may still win. Revoked rules are
/// skipped and the next candidate is tried.
pub trait RuleLiveness: Send + Sync {
    fn is_live(&self, rule_id: &str, snapshot: &RuleSnapshot) -> bool;
}

impl RuleLiveness for RuleStore {
    fn is_live(&self, rule_id: &str, snapshot: &RuleSnapshot) -> bool {
        RuleStore::is_live(self, rule_id, snapshot)
    }
}

/// Every rule in the snapshot is considered live
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLive;

impl RuleLiveness for AlwaysLive {
    fn is_live(&self, _rule_id: &str, _snapshot: &RuleSnapshot) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub rule_id: String,
    pub unit_id: String,
    pub matched_at: DateTime<Utc>,
}

/// What the transport does with the unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Verdict {
    /// Send the (possibly modified) unit on
    Forward,
    /// Answer the device with this response; the backend is not contacted
    Respond { response: HttpResponse },
    /// Fail the connection
    ConnectionError { message: String },
    /// Dropped by the operator
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Annotations {
    pub timed_out: bool,
    pub edited: bool,
    pub mocked: bool,
    pub mock_error: Option<String>,
    pub chaos_fault: Option<String>,
    pub store_unavailable: bool,
    /// A breakpoint matched but too many units were already held
    pub breakpoint_skipped: bool,
}

fn winner_id<R, S>(rule: &Option<Arc<R>>, serializer: S) -> Result<S::Ok, S::Error>
where
    R: Matchable,
    S: Serializer,
{
    match rule {
        Some(rule) => serializer.serialize_some(&rule.meta().id),
        None => serializer.serialize_none(),
    }
}

/// Outcome of one arbitration pass
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    #[serde(serialize_with = "winner_id")]
    pub mock: Option<Arc<MockRule>>,
    #[serde(serialize_with = "winner_id")]
    pub breakpoint: Option<Arc<BreakpointRule>>,
    #[serde(serialize_with = "winner_id")]
    pub chaos: Option<Arc<ChaosRule>>,
    pub matches: Vec<MatchResult>,
    pub unit: TrafficUnit,
    pub verdict: Verdict,
    pub annotations: Annotations,
}

impl Decision {
    /// No winners, forward unchanged
    pub fn pass_through(unit: TrafficUnit) -> Self {
        Self {
            mock: None,
            breakpoint: None,
            chaos: None,
            matches: Vec::new(),
            unit,
            verdict: Verdict::Forward,
            annotations: Annotations::default(),
        }
    }

    pub fn has_winner(&self) -> bool {
        self.mock.is_some() || self.breakpoint.is_some() || self.chaos.is_some()
    }

    pub fn mock_rule_id(&self) -> Option<&str> {
        self.mock.as_ref().map(|r| r.meta.id.as_str())
    }

    pub fn breakpoint_rule_id(&self) -> Option<&str> {
        self.breakpoint.as_ref().map(|r| r.meta.id.as_str())
    }

    pub fn chaos_rule_id(&self) -> Option<&str> {
        self.chaos.as_ref().map(|r| r.meta.id.as_str())
    }
}

fn select<R: Matchable>(
    candidates: &[Arc<R>],
    unit: &TrafficUnit,
    snapshot: &RuleSnapshot,
    liveness: &dyn RuleLiveness,
) -> Option<Arc<R>> {
    candidates
        .iter()
        .filter(|rule| matcher::matches::<R>(rule, unit))
        .filter(|rule| {
            let live = liveness.is_live(&rule.meta().id, snapshot);
            if !live {
                debug!(rule_id = %rule.meta().id, "Matched rule was revoked, trying next");
            }
            live
        })
        .min_by(|a, b| priority_order(a.meta(), b.meta()))
        .cloned()
}

/// Pick at most one winner per category for `unit`
pub fn decide(unit: TrafficUnit, snapshot: &RuleSnapshot, liveness: &dyn RuleLiveness) -> Decision {
    let breakpoint = select(&snapshot.breakpoint_rules, &unit, snapshot, liveness);
    let mock = select(&snapshot.mock_rules, &unit, snapshot, liveness);
    let chaos = select(&snapshot.chaos_rules, &unit, snapshot, liveness);

    let now = Utc::now();
    let matches = [
        breakpoint.as_ref().map(|r| r.meta.id.clone()),
        mock.as_ref().map(|r| r.meta.id.clone()),
        chaos.as_ref().map(|r| r.meta.id.clone()),
    ]
    .into_iter()
    .flatten()
    .map(|rule_id| MatchResult {
        rule_id,
        unit_id: unit.id().to_string(),
        matched_at: now,
    })
    .collect::<Vec<_>>();

    if !matches.is_empty() {
        debug!(
            unit_id = %unit.id(),
            phase = %unit.phase(),
            winners = ?matches.iter().map(|m| m.rule_id.as_str()).collect::<Vec<_>>(),
            "Arbitration complete"
        );
    }

    Decision {
        mock,
        breakpoint,
        chaos,
        matches,
        unit,
        verdict: Verdict::Forward,
        annotations: Annotations::default(),
    }
}
