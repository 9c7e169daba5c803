//! Breakpoint suspension and operator release
//!
//! A unit caught by a breakpoint goes through `Armed -> Suspended` and then
//! exactly one of `Resumed`, `Edited`, `TimedOut` or `Cancelled`. Only the
//! task that owns the unit waits; everything else keeps flowing.
//!
//! Release is decided by whoever removes the pending entry first. The
//! operator path removes it and sends on the oneshot; the timeout path
//! removes it and reports `TimedOut`. If the timeout fires but the entry is
//! already gone, the operator won and its signal is read from the channel.

use crate::admin::Metrics;
use crate::error::EngineError;
use crate::rules::BreakpointRule;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_common::{Headers, Phase, TrafficUnit};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointState {
    Armed,
    Suspended,
}

/// Operator-visible view of a held unit
#[derive(Debug, Clone, Serialize)]
pub struct PendingBreakpoint {
    pub id: String,
    pub rule_id: String,
    pub phase: Phase,
    pub state: BreakpointState,
    pub unit: TrafficUnit,
    pub armed_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    /// Auto-resume time
    pub deadline: Option<DateTime<Utc>>,
}

/// Changes an operator makes before letting a unit go
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitEdit {
    /// Replaces the headers of the current phase
    pub headers: Option<Headers>,
    /// Replaces the body of the current phase, or the frame payload
    #[serde(with = "hub_common::body::option")]
    pub body: Option<Vec<u8>>,
    /// Response phase only
    pub status_code: Option<u16>,
    pub url: Option<String>,
    pub method: Option<String>,
    /// Skip automated mock and chaos for this unit
    pub bypass_rules: bool,
}

impl UnitEdit {
    pub fn apply(&self, unit: &mut TrafficUnit) {
        match unit {
            TrafficUnit::Http(exchange) => {
                if let Some(url) = &self.url {
                    exchange.url = url.clone();
                }
                if let Some(method) = &self.method {
                    exchange.method = method.clone();
                }
                match exchange.response.as_mut() {
                    Some(response) => {
                        if let Some(headers) = &self.headers {
                            response.headers = headers.clone();
                        }
                        if let Some(body) = &self.body {
                            response.body = body.clone();
                        }
                        if let Some(status) = self.status_code {
                            response.status_code = status;
                        }
                    }
                    None => {
                        if let Some(headers) = &self.headers {
                            exchange.request_headers = headers.clone();
                        }
                        if let Some(body) = &self.body {
                            exchange.request_body = body.clone();
                        }
                    }
                }
            }
            TrafficUnit::Frame(frame) => {
                if let Some(body) = &self.body {
                    frame.payload = body.clone();
                }
            }
        }
    }
}

#[derive(Debug)]
enum Signal {
    Resume,
    Edit(UnitEdit),
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointOutcome {
    Resumed(TrafficUnit),
    Edited {
        unit: TrafficUnit,
        bypass_rules: bool,
    },
    TimedOut(TrafficUnit),
    Cancelled(TrafficUnit),
}

impl BreakpointOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakpointOutcome::Resumed(_) => "resumed",
            BreakpointOutcome::Edited { .. } => "edited",
            BreakpointOutcome::TimedOut(_) => "timed_out",
            BreakpointOutcome::Cancelled(_) => "cancelled",
        }
    }

    pub fn into_unit(self) -> TrafficUnit {
        match self {
            BreakpointOutcome::Resumed(unit)
            | BreakpointOutcome::Edited { unit, .. }
            | BreakpointOutcome::TimedOut(unit)
            | BreakpointOutcome::Cancelled(unit) => unit,
        }
    }
}

/// Broadcast to subscribers (admin API, agent logs)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum BreakpointNotice {
    Suspended(PendingBreakpoint),
    Released { id: String, outcome: String },
}

struct Entry {
    info: PendingBreakpoint,
    tx: oneshot::Sender<Signal>,
}

#[derive(Clone)]
pub struct BreakpointController {
    /// Breakpoint id -> entry holding the release channel
    pending: Arc<DashMap<String, Entry>>,
    /// Slots taken by armed handles, reserved before the entry is inserted
    held: Arc<AtomicUsize>,
    notices: broadcast::Sender<BreakpointNotice>,
    max_pending: usize,
    metrics: Arc<Metrics>,
}

impl BreakpointController {
    pub fn new(max_pending: usize) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            pending: Arc::new(DashMap::new()),
            held: Arc::new(AtomicUsize::new(0)),
            notices,
            max_pending,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakpointNotice> {
        self.notices.subscribe()
    }

    /// Register a unit for suspension. Returns `None` when the pending limit
    /// is reached; the caller then lets the unit through.
    pub fn arm(&self, unit: TrafficUnit, rule: &BreakpointRule) -> Option<ArmedBreakpoint> {
        if self.held.fetch_add(1, Ordering::AcqRel) >= self.max_pending {
            self.held.fetch_sub(1, Ordering::AcqRel);
            self.metrics.breakpoints_skipped.fetch_add(1, Ordering::Relaxed);
            warn!(
                rule_id = %rule.meta.id,
                unit_id = %unit.id(),
                "Breakpoint limit of {} reached, passing unit through",
                self.max_pending
            );
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let info = PendingBreakpoint {
            id: id.clone(),
            rule_id: rule.meta.id.clone(),
            phase: unit.phase(),
            state: BreakpointState::Armed,
            unit: unit.clone(),
            armed_at: Utc::now(),
            suspended_at: None,
            deadline: None,
        };
        self.pending.insert(id.clone(), Entry { info, tx });

        Some(ArmedBreakpoint {
            guard: PendingGuard {
                id,
                pending: Arc::clone(&self.pending),
                held: Arc::clone(&self.held),
            },
            unit,
            rx,
            notices: self.notices.clone(),
            metrics: Arc::clone(&self.metrics),
        })
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        self.signal(id, Signal::Resume)
    }

    pub fn resume_with_edits(&self, id: &str, edit: UnitEdit) -> Result<()> {
        self.signal(id, Signal::Edit(edit))
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        self.signal(id, Signal::Cancel)
    }

    fn signal(&self, id: &str, signal: Signal) -> Result<()> {
        let removed = self
            .pending
            .remove_if(id, |_, entry| entry.info.state == BreakpointState::Suspended);

        match removed {
            Some((_, entry)) => {
                info!(breakpoint_id = id, rule_id = %entry.info.rule_id, "Operator signal: {:?}", signal);
                if entry.tx.send(signal).is_err() {
                    warn!(breakpoint_id = id, "Waiting task is gone, signal discarded");
                }
                Ok(())
            }
            None => {
                self.metrics.invalid_transitions.fetch_add(1, Ordering::Relaxed);
                let reason = if self.pending.contains_key(id) {
                    "breakpoint is armed but not yet suspended"
                } else {
                    "unknown or already released"
                };
                let err = EngineError::transition(id, reason);
                warn!("{}", err);
                Err(err)
            }
        }
    }

    /// Suspended units, oldest first
    pub fn pending(&self) -> Vec<PendingBreakpoint> {
        let mut pending: Vec<PendingBreakpoint> = self
            .pending
            .iter()
            .filter(|e| e.info.state == BreakpointState::Suspended)
            .map(|e| e.info.clone())
            .collect();
        pending.sort_by_key(|p| p.suspended_at);
        pending
    }

    pub fn get(&self, id: &str) -> Option<PendingBreakpoint> {
        self.pending
            .get(id)
            .filter(|e| e.info.state == BreakpointState::Suspended)
            .map(|e| e.info.clone())
    }

    /// Suspended units currently held
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resume everything that is suspended; used on shutdown
    pub fn release_all(&self) -> usize {
        let ids: Vec<String> = self.pending().into_iter().map(|p| p.id).collect();
        ids.iter().filter(|id| self.resume(id).is_ok()).count()
    }
}

/// Removes the pending entry and frees the slot when the owning task goes
/// away
struct PendingGuard {
    id: String,
    pending: Arc<DashMap<String, Entry>>,
    held: Arc<AtomicUsize>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // no-op once released
        self.pending.remove(&self.id);
        self.held.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle owned by the task whose unit is held
pub struct ArmedBreakpoint {
    guard: PendingGuard,
    unit: TrafficUnit,
    rx: oneshot::Receiver<Signal>,
    notices: broadcast::Sender<BreakpointNotice>,
    metrics: Arc<Metrics>,
}

impl ArmedBreakpoint {
    pub fn id(&self) -> &str {
        &self.guard.id
    }

    /// Expose the unit to operators and wait for a signal or `timeout`
    pub async fn suspend(self, timeout: Duration) -> BreakpointOutcome {
        let ArmedBreakpoint {
            guard,
            unit,
            mut rx,
            notices,
            metrics,
        } = self;
        let id = guard.id.as_str();

        let now = Utc::now();
        let suspended = guard.pending.get_mut(id).map(|mut entry| {
            entry.info.state = BreakpointState::Suspended;
            entry.info.suspended_at = Some(now);
            entry.info.deadline = chrono::Duration::from_std(timeout).ok().map(|d| now + d);
            entry.info.clone()
        });
        if let Some(info) = suspended {
            info!(
                breakpoint_id = id,
                rule_id = %info.rule_id,
                phase = %info.phase,
                "Unit suspended at breakpoint (timeout {:?})",
                timeout
            );
            metrics.breakpoints_suspended.fetch_add(1, Ordering::Relaxed);
            let _ = notices.send(BreakpointNotice::Suspended(info));
        }

        let released = |outcome: &str| {
            let _ = notices.send(BreakpointNotice::Released {
                id: id.to_string(),
                outcome: outcome.to_string(),
            });
        };

        let received = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                if guard.pending.remove(id).is_some() {
                    info!(breakpoint_id = id, "Breakpoint timed out, resuming unmodified");
                    metrics.breakpoints_timed_out.fetch_add(1, Ordering::Relaxed);
                    released("timed_out");
                    return BreakpointOutcome::TimedOut(unit);
                }
                // an operator released it just as the deadline passed
                rx.await
            }
        };

        let outcome = match received {
            Ok(Signal::Resume) => BreakpointOutcome::Resumed(unit),
            Ok(Signal::Edit(edit)) => {
                let mut unit = unit;
                edit.apply(&mut unit);
                BreakpointOutcome::Edited {
                    unit,
                    bypass_rules: edit.bypass_rules,
                }
            }
            Ok(Signal::Cancel) => BreakpointOutcome::Cancelled(unit),
            Err(_) => {
                warn!(breakpoint_id = id, "Release channel closed, resuming unmodified");
                BreakpointOutcome::Resumed(unit)
            }
        };
        info!(breakpoint_id = id, outcome = outcome.as_str(), "Breakpoint released");
        released(outcome.as_str());
        outcome
    }
}
