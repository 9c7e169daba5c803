//! Rule snapshots per device
//!
//! The store keeps one immutable [`RuleSnapshot`] per device behind an `Arc`.
//! A lookup either hands out the cached snapshot or, once it is older than
//! the staleness window, fetches a fresh one from the [`RuleSource`] and
//! swaps it in. Readers holding the old `Arc` keep a consistent view for the
//! rest of their pass.

use crate::admin::Metrics;
use crate::error::EngineError;
use crate::rules::{BreakpointRule, ChaosRule, MockRule, Rule};
use crate::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use hub_common::{RuleKind, RuleMeta, RuleRecord};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Persistence collaborator holding the rule tables
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Enabled rules of one kind visible to `device_id`, global rules
    /// included. Fails with [`EngineError::StoreUnavailable`].
    async fn fetch_enabled_rules(&self, device_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>>;
}

/// Total order used everywhere rules compete: priority descending, then id
/// ascending.
pub fn priority_order(a: &RuleMeta, b: &RuleMeta) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

/// A record that was fetched but could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRule {
    pub rule_id: String,
    pub kind: RuleKind,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub device_id: String,
    pub mock_rules: Vec<Arc<MockRule>>,
    pub breakpoint_rules: Vec<Arc<BreakpointRule>>,
    pub chaos_rules: Vec<Arc<ChaosRule>>,
    pub rejected: Vec<RejectedRule>,
    pub fetched_at: Instant,
}

impl RuleSnapshot {
    /// Snapshot with no rules, used when the store cannot be reached
    pub fn empty(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            mock_rules: Vec::new(),
            breakpoint_rules: Vec::new(),
            chaos_rules: Vec::new(),
            rejected: Vec::new(),
            fetched_at: Instant::now(),
        }
    }

    /// Filter, decode and sort fetched records
    pub fn build(device_id: &str, records: impl IntoIterator<Item = RuleRecord>) -> Self {
        let mut snapshot = Self::empty(device_id);

        for record in records {
            let meta = record.meta();
            if !meta.enabled || !meta.applies_to_device(device_id) {
                continue;
            }
            match Rule::compile(&record) {
                Ok(Rule::Mock(rule)) => snapshot.mock_rules.push(Arc::new(rule)),
                Ok(Rule::Breakpoint(rule)) => snapshot.breakpoint_rules.push(Arc::new(rule)),
                Ok(Rule::Chaos(rule)) => snapshot.chaos_rules.push(Arc::new(rule)),
                Err(e) => {
                    warn!(rule_id = %record.id(), kind = %record.kind(), "Skipping rule: {}", e);
                    let reason = match e {
                        EngineError::MatchEvaluationError { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    snapshot.rejected.push(RejectedRule {
                        rule_id: record.id().to_string(),
                        kind: record.kind(),
                        reason,
                    });
                }
            }
        }

        snapshot.mock_rules.sort_by(|a, b| priority_order(&a.meta, &b.meta));
        snapshot.breakpoint_rules.sort_by(|a, b| priority_order(&a.meta, &b.meta));
        snapshot.chaos_rules.sort_by(|a, b| priority_order(&a.meta, &b.meta));
        snapshot
    }

    pub fn rule_count(&self) -> usize {
        self.mock_rules.len() + self.breakpoint_rules.len() + self.chaos_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count() == 0
    }
}

pub struct RuleStore {
    source: Arc<dyn RuleSource>,
    snapshots: DashMap<String, Arc<RuleSnapshot>>,
    /// Rule id -> when it was revoked through the push path
    revoked: DashMap<String, Instant>,
    /// One in-flight refetch per device
    refresh_gates: DashMap<String, Arc<Mutex<()>>>,
    /// Rejected rule ids already counted in `rules_rejected`
    rejected_ids: DashSet<String>,
    staleness: Duration,
    metrics: Arc<Metrics>,
}

impl RuleStore {
    pub fn new(source: Arc<dyn RuleSource>, staleness: Duration) -> Self {
        Self {
            source,
            snapshots: DashMap::new(),
            revoked: DashMap::new(),
            refresh_gates: DashMap::new(),
            rejected_ids: DashSet::new(),
            staleness,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current snapshot for a device, refetched when stale. Concurrent
    /// lookups of a stale device share a single refetch.
    pub async fn snapshot(&self, device_id: &str) -> Result<Arc<RuleSnapshot>> {
        if let Some(fresh) = self.fresh_snapshot(device_id) {
            return Ok(fresh);
        }

        let gate = self.refresh_gate(device_id);
        let _in_flight = gate.lock().await;
        // another worker may have refreshed while we waited
        if let Some(fresh) = self.fresh_snapshot(device_id) {
            return Ok(fresh);
        }
        self.refresh(device_id).await
    }

    fn fresh_snapshot(&self, device_id: &str) -> Option<Arc<RuleSnapshot>> {
        self.snapshots
            .get(device_id)
            .filter(|cached| cached.fetched_at.elapsed() < self.staleness)
            .map(|cached| Arc::clone(cached.value()))
    }

    fn refresh_gate(&self, device_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.refresh_gates
                .entry(device_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Fetch every rule kind for a device and swap the cached snapshot
    pub async fn refresh(&self, device_id: &str) -> Result<Arc<RuleSnapshot>> {
        let mut records = Vec::new();
        for kind in RuleKind::ALL {
            match self.source.fetch_enabled_rules(device_id, kind).await {
                Ok(batch) => records.extend(batch),
                Err(e) => {
                    self.metrics.store_failures.fetch_add(1, AtomicOrdering::Relaxed);
                    return Err(match e {
                        EngineError::StoreUnavailable(_) => e,
                        other => EngineError::StoreUnavailable(other.to_string()),
                    });
                }
            }
        }

        let snapshot = Arc::new(RuleSnapshot::build(device_id, records));
        let newly_rejected = snapshot
            .rejected
            .iter()
            .filter(|rejected| self.rejected_ids.insert(rejected.rule_id.clone()))
            .count();
        if newly_rejected > 0 {
            self.metrics
                .rules_rejected
                .fetch_add(newly_rejected as u64, AtomicOrdering::Relaxed);
        }
        debug!(
            device_id,
            rules = snapshot.rule_count(),
            rejected = snapshot.rejected.len(),
            "Rule snapshot refreshed"
        );

        self.snapshots
            .insert(device_id.to_string(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Drop the cached snapshot so the next lookup refetches
    pub fn invalidate(&self, device_id: &str) {
        if self.snapshots.remove(device_id).is_some() {
            debug!(device_id, "Rule snapshot invalidated");
        }
    }

    /// Treat a rule as disabled right away, including in snapshots already
    /// handed out. After one staleness window the store's view wins again.
    pub fn revoke(&self, rule_id: &str) {
        info!(rule_id, "Rule revoked");
        self.revoked.insert(rule_id.to_string(), Instant::now());
    }

    /// Whether a rule from `snapshot` may still win
    pub fn is_live(&self, rule_id: &str, _snapshot: &RuleSnapshot) -> bool {
        match self.revoked.get(rule_id) {
            None => true,
            Some(revoked_at) => revoked_at.elapsed() >= self.staleness,
        }
    }

    /// Refresh every cached device. Failures keep the previous snapshot.
    pub async fn refresh_all(&self) {
        let devices = self.cached_devices();
        for device_id in &devices {
            let gate = self.refresh_gate(device_id);
            let _in_flight = gate.lock().await;
            if let Err(e) = self.refresh(device_id).await {
                warn!(device_id = %device_id, "Background rule refresh failed: {}", e);
            }
        }

        let staleness = self.staleness;
        self.revoked.retain(|_, revoked_at| revoked_at.elapsed() < staleness);
    }

    /// Start the single background refresher
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        info!("Rule refresher started (every {:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.refresh_all().await;
            }
        })
    }

    pub fn cached_devices(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.key().clone()).collect()
    }
}

/// Rule source backed by a concurrent map
#[derive(Default)]
pub struct InMemoryRuleSource {
    rules: DashMap<String, RuleRecord>,
    unavailable: AtomicBool,
    fetches: AtomicU64,
}

impl InMemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = RuleRecord>) -> Self {
        let source = Self::new();
        for rule in rules {
            source.insert(rule);
        }
        source
    }

    /// Insert or replace a rule by id
    pub fn insert(&self, rule: RuleRecord) {
        self.rules.insert(rule.id().to_string(), rule);
    }

    pub fn get(&self, rule_id: &str) -> Option<RuleRecord> {
        self.rules.get(rule_id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<RuleRecord> {
        self.rules.iter().map(|r| r.value().clone()).collect()
    }

    /// Apply `f` to a stored rule; false if the id is unknown
    pub fn update(&self, rule_id: &str, f: impl FnOnce(&mut RuleRecord)) -> bool {
        match self.rules.get_mut(rule_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, rule_id: &str) -> Option<RuleRecord> {
        self.rules.remove(rule_id).map(|(_, r)| r)
    }

    pub fn count(&self) -> usize {
        self.rules.len()
    }

    /// Simulate the backing store going away and coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, AtomicOrdering::SeqCst);
    }

    /// Number of `fetch_enabled_rules` calls served so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl RuleSource for InMemoryRuleSource {
    async fn fetch_enabled_rules(&self, device_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(EngineError::StoreUnavailable(
                "in-memory rule source marked unavailable".to_string(),
            ));
        }

        Ok(self
            .rules
            .iter()
            .filter(|r| r.kind() == kind)
            .filter(|r| r.meta().enabled && r.meta().applies_to_device(device_id))
            .map(|r| r.value().clone())
            .collect())
    }
}
