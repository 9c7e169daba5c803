//! Common data model for DebugHub modules
//!
//! Shared between the interception engine and the agent harness:
//! - traffic units handed to the engine by the transport layer
//! - rule records as they come out of the persistence layer
//! - finalized events handed back for durable storage

pub mod body;
pub mod event;
pub mod rule;
pub mod traffic;

pub use event::{HttpEvent, LogEvent, QueryItem, RecordedEvent, WsFrameEvent, WsSessionEvent};
pub use rule::{
    BreakpointRuleRecord, ChaosRuleRecord, MockRuleRecord, RuleKind, RuleMeta, RuleRecord,
};
pub use traffic::{
    Direction, Headers, HttpExchange, HttpResponse, Opcode, Phase, TrafficUnit, UnknownPhase,
    WsFrame,
};
