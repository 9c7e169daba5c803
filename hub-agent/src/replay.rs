//! Replay of captured traffic through the engine
//!
//! Each input line is one JSON record tagged by `kind`. Traffic units are
//! processed concurrently, one task per unit, so a unit held at a breakpoint
//! does not stall the rest of the capture.

use hub_common::{HttpExchange, LogEvent, WsFrame, WsSessionEvent};
use intercept_core::{Decision, InterceptEngine, Verdict};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A transport failure reported for an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpFailure {
    pub exchange: HttpExchange,
    pub description: String,
}

/// One line of a capture file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    /// Request phase, or response phase when `response` is present
    Http(HttpExchange),
    Frame(WsFrame),
    Log(LogEvent),
    Session(WsSessionEvent),
    Error(HttpFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub units: usize,
    pub mocked: usize,
    pub suspended: usize,
    pub chaos: usize,
    pub cancelled: usize,
    pub connection_errors: usize,
    pub records: usize,
    pub skipped_lines: usize,
}

impl ReplaySummary {
    fn count(&mut self, decision: &Decision) {
        self.units += 1;
        if decision.annotations.mocked {
            self.mocked += 1;
        }
        if decision.breakpoint.is_some() && !decision.annotations.breakpoint_skipped {
            self.suspended += 1;
        }
        if decision.annotations.chaos_fault.is_some() {
            self.chaos += 1;
        }
        match decision.verdict {
            Verdict::Cancelled => self.cancelled += 1,
            Verdict::ConnectionError { .. } => self.connection_errors += 1,
            _ => {}
        }
    }
}

pub async fn replay_file(engine: &Arc<InterceptEngine>, path: &Path) -> anyhow::Result<ReplaySummary> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to open capture {}: {}", path.display(), e)
    })?;
    info!("Replaying {}", path.display());
    replay_lines(engine, BufReader::new(file)).await
}

pub async fn replay_lines<R>(engine: &Arc<InterceptEngine>, reader: R) -> anyhow::Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut in_flight: Vec<JoinHandle<Decision>> = Vec::new();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, "Skipping unreadable capture line: {}", e);
                summary.skipped_lines += 1;
                continue;
            }
        };

        let engine = Arc::clone(engine);
        match record {
            ReplayRecord::Http(exchange) => in_flight.push(tokio::spawn(async move {
                match exchange.response.clone() {
                    Some(response) => engine.on_http_response(exchange, response).await,
                    None => engine.on_http_request(exchange).await,
                }
            })),
            ReplayRecord::Frame(frame) => {
                in_flight.push(tokio::spawn(async move { engine.on_ws_frame(frame).await }))
            }
            ReplayRecord::Log(event) => {
                engine.record_log(event);
                summary.records += 1;
            }
            ReplayRecord::Session(event) => {
                engine.record_ws_session(event);
                summary.records += 1;
            }
            ReplayRecord::Error(failure) => {
                engine.on_http_error(&failure.exchange, failure.description);
                summary.records += 1;
            }
        }
    }

    for handle in in_flight {
        let decision = handle.await?;
        info!(
            unit_id = %decision.unit.id(),
            device_id = %decision.unit.device_id(),
            phase = %decision.unit.phase().as_str(),
            mock = ?decision.mock_rule_id(),
            breakpoint = ?decision.breakpoint_rule_id(),
            chaos = ?decision.chaos_rule_id(),
            verdict = ?decision.verdict,
            "Unit decided"
        );
        summary.count(&decision);
    }

    Ok(summary)
}
