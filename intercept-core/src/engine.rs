//! Interception engine facade
//!
//! The transport calls one entry point per traffic unit, from the task that
//! owns the unit. Each call runs the fixed pipeline (snapshot, arbitration,
//! breakpoint, mock, chaos) and returns a [`Decision`]. Failures inside the
//! pipeline degrade to pass-through and show up as annotations.

use crate::admin::Metrics;
use crate::arbiter::{self, Annotations, Decision, Verdict};
use crate::breakpoint::{BreakpointController, BreakpointOutcome, PendingBreakpoint, UnitEdit};
use crate::chaos::{ChaosEffect, ChaosExecutor, RandomSource};
use crate::config::EngineConfig;
use crate::mock;
use crate::recorder::{EventRecorder, EventSink, RecorderStats};
use crate::store::{RuleSnapshot, RuleSource, RuleStore};
use crate::Result;
use hub_common::{
    HttpEvent, HttpExchange, HttpResponse, LogEvent, Phase, RecordedEvent, TrafficUnit, WsFrame,
    WsFrameEvent, WsSessionEvent,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background tasks started by [`InterceptEngine::start`]
pub struct EngineTasks {
    pub recorder: JoinHandle<()>,
    pub refresher: JoinHandle<()>,
}

pub struct InterceptEngine {
    config: EngineConfig,
    store: Arc<RuleStore>,
    breakpoints: BreakpointController,
    chaos: ChaosExecutor,
    recorder: EventRecorder,
    metrics: Arc<Metrics>,
}

impl InterceptEngine {
    pub fn new(config: EngineConfig, source: Arc<dyn RuleSource>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::default());

        let store = RuleStore::new(source, config.rule_store.staleness())
            .with_metrics(Arc::clone(&metrics));
        let breakpoints = BreakpointController::new(config.breakpoint.max_pending)
            .with_metrics(Arc::clone(&metrics));
        let chaos = ChaosExecutor::new(&config.chaos);
        let recorder = EventRecorder::new(config.recorder.queue_capacity, Arc::clone(&metrics));

        Ok(Self {
            config,
            store: Arc::new(store),
            breakpoints,
            chaos,
            recorder,
            metrics,
        })
    }

    /// Replace the chaos randomness, keeping the configured on/off switch
    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.chaos = ChaosExecutor::with_source(random).with_enabled(self.config.chaos.enabled);
        self
    }

    /// Start the recorder drain and the rule refresher
    pub fn start(&self, sink: Arc<dyn EventSink>) -> EngineTasks {
        EngineTasks {
            recorder: self.recorder.spawn(sink),
            refresher: self
                .store
                .spawn_refresher(self.config.rule_store.refresh_interval()),
        }
    }

    /// Release held units and stop accepting events
    pub fn shutdown(&self) {
        let released = self.breakpoints.release_all();
        if released > 0 {
            warn!("Released {} suspended units on shutdown", released);
        }
        self.recorder.close();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn rule_store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn breakpoints(&self) -> &BreakpointController {
        &self.breakpoints
    }

    pub fn recorder_stats(&self) -> RecorderStats {
        self.recorder.stats()
    }

    pub async fn on_http_request(&self, exchange: HttpExchange) -> Decision {
        self.process(TrafficUnit::Http(exchange)).await
    }

    pub async fn on_http_response(&self, mut exchange: HttpExchange, response: HttpResponse) -> Decision {
        exchange.response = Some(response);
        self.process(TrafficUnit::Http(exchange)).await
    }

    pub async fn on_ws_frame(&self, frame: WsFrame) -> Decision {
        self.process(TrafficUnit::Frame(frame)).await
    }

    /// The exchange failed in transport before a response arrived
    pub fn on_http_error(&self, exchange: &HttpExchange, description: impl Into<String>) {
        let mut event = HttpEvent::from_exchange(exchange);
        event.error_description = Some(description.into());
        self.recorder.record(RecordedEvent::Http(event));
    }

    pub fn record_log(&self, event: LogEvent) {
        self.recorder.record(RecordedEvent::Log(event));
    }

    pub fn record_ws_session(&self, event: WsSessionEvent) {
        self.recorder.record(RecordedEvent::WsSession(event));
    }

    pub fn resume_breakpoint(&self, id: &str) -> Result<()> {
        self.breakpoints.resume(id)
    }

    pub fn resume_with_edits(&self, id: &str, edit: UnitEdit) -> Result<()> {
        self.breakpoints.resume_with_edits(id, edit)
    }

    pub fn cancel_breakpoint(&self, id: &str) -> Result<()> {
        self.breakpoints.cancel(id)
    }

    pub fn pending_breakpoints(&self) -> Vec<PendingBreakpoint> {
        self.breakpoints.pending()
    }

    async fn process(&self, unit: TrafficUnit) -> Decision {
        self.metrics.units_processed.fetch_add(1, Ordering::Relaxed);
        let device_id = unit.device_id().to_string();

        let mut store_unavailable = false;
        let snapshot = match self.store.snapshot(&device_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(device_id = %device_id, "No rules for unit {}: {}", unit.id(), e);
                store_unavailable = true;
                Arc::new(RuleSnapshot::empty(&device_id))
            }
        };

        let Decision {
            mock,
            breakpoint,
            chaos,
            matches,
            mut unit,
            ..
        } = arbiter::decide(unit, &snapshot, self.store.as_ref());
        let mut verdict = Verdict::Forward;
        let mut annotations = Annotations {
            store_unavailable,
            ..Annotations::default()
        };
        let mut bypass_rules = false;

        if let Some(rule) = &breakpoint {
            match self.breakpoints.arm(unit.clone(), rule) {
                Some(armed) => {
                    let timeout = rule
                        .timeout
                        .unwrap_or_else(|| self.config.breakpoint.default_timeout());
                    match armed.suspend(timeout).await {
                        BreakpointOutcome::Resumed(released) => unit = released,
                        BreakpointOutcome::Edited {
                            unit: edited,
                            bypass_rules: bypass,
                        } => {
                            unit = edited;
                            annotations.edited = true;
                            bypass_rules = bypass;
                        }
                        BreakpointOutcome::TimedOut(released) => {
                            unit = released;
                            annotations.timed_out = true;
                        }
                        BreakpointOutcome::Cancelled(released) => {
                            unit = released;
                            verdict = Verdict::Cancelled;
                        }
                    }
                }
                None => annotations.breakpoint_skipped = true,
            }
        }

        let mut mock_response = None;
        if verdict == Verdict::Forward && !bypass_rules {
            if let Some(rule) = &mock {
                match mock::apply_mock(rule, &unit) {
                    Ok(outcome) => {
                        self.metrics.mocks_applied.fetch_add(1, Ordering::Relaxed);
                        annotations.mocked = true;
                        if let Some(delay) = outcome.delay {
                            tokio::time::sleep(delay).await;
                        }
                        unit = outcome.unit;
                        if let Some(response) = outcome.response {
                            mock_response = Some(response.clone());
                            verdict = Verdict::Respond { response };
                        }
                    }
                    Err(e) => {
                        self.metrics.mock_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(unit_id = %unit.id(), "Mock not applied, passing through: {}", e);
                        annotations.mock_error = Some(e.to_string());
                    }
                }
            }
        }

        // chaos never applies to mocked units
        if verdict == Verdict::Forward && !bypass_rules && !annotations.mocked {
            if let Some(rule) = &chaos {
                let outcome = self.chaos.apply_chaos(rule, unit);
                unit = outcome.unit;
                if let Some(effect) = outcome.injected {
                    self.metrics.chaos_injected.fetch_add(1, Ordering::Relaxed);
                    annotations.chaos_fault = Some(rule.fault.name().to_string());
                    match effect {
                        ChaosEffect::Delay(delay) => tokio::time::sleep(delay).await,
                        ChaosEffect::ConnectionError(message) => {
                            verdict = Verdict::ConnectionError { message }
                        }
                        _ => {}
                    }
                }
            }
        }

        let mock_rule_id = if annotations.mocked {
            mock.as_ref().map(|r| r.meta.id.clone())
        } else {
            None
        };
        self.record_unit(&unit, &verdict, mock_response, mock_rule_id);

        debug!(
            unit_id = %unit.id(),
            phase = %unit.phase(),
            verdict = ?verdict,
            "Unit processed"
        );

        Decision {
            mock,
            breakpoint,
            chaos,
            matches,
            unit,
            verdict,
            annotations,
        }
    }

    /// Hand the finished unit to the recorder. HTTP exchanges are recorded
    /// once, when they end: at the response phase, or at the request phase
    /// when they were answered or stopped here.
    fn record_unit(
        &self,
        unit: &TrafficUnit,
        verdict: &Verdict,
        mock_response: Option<HttpResponse>,
        mock_rule_id: Option<String>,
    ) {
        match unit {
            TrafficUnit::Http(exchange) => {
                let mut event = match (exchange.phase(), verdict) {
                    (Phase::Response, _) => HttpEvent::from_exchange(exchange),
                    (_, Verdict::Forward) => return,
                    (_, Verdict::Respond { .. }) => {
                        let mut answered = exchange.clone();
                        answered.response = mock_response;
                        HttpEvent::from_exchange(&answered)
                    }
                    (_, Verdict::ConnectionError { message }) => {
                        let mut event = HttpEvent::from_exchange(exchange);
                        event.error_description = Some(message.clone());
                        event
                    }
                    (_, Verdict::Cancelled) => {
                        let mut event = HttpEvent::from_exchange(exchange);
                        event.error_description = Some("cancelled at breakpoint".to_string());
                        event
                    }
                };
                event.is_mocked = mock_rule_id.is_some();
                event.mock_rule_id = mock_rule_id;
                self.recorder.record(RecordedEvent::Http(event));
            }
            TrafficUnit::Frame(frame) => {
                let mut event = WsFrameEvent::from_frame(frame);
                event.is_mocked = mock_rule_id.is_some();
                event.mock_rule_id = mock_rule_id;
                self.recorder.record(RecordedEvent::WsFrame(event));
            }
        }
    }
}
