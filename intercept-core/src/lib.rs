//! Interception Core Library
//!
//! Decides, for every live HTTP request/response or WebSocket frame, which
//! mock, breakpoint and chaos rule applies, and executes the winners without
//! stalling unrelated traffic.

pub mod admin;
pub mod arbiter;
pub mod breakpoint;
pub mod chaos;
pub mod engine;
pub mod matcher;
pub mod mock;
pub mod recorder;
pub mod rules;
pub mod store;

/// Configuration types and utilities
pub mod config;

/// Error types for engine operations
pub mod error;

pub use admin::{router, start_admin_server, Metrics};
pub use arbiter::{decide, AlwaysLive, Annotations, Decision, MatchResult, RuleLiveness, Verdict};
pub use breakpoint::{
    ArmedBreakpoint, BreakpointController, BreakpointNotice, BreakpointOutcome, PendingBreakpoint,
    UnitEdit,
};
pub use chaos::{ChaosEffect, ChaosExecutor, ChaosOutcome, RandomSource, SeededRandom, ThreadRandom};
pub use config::EngineConfig;
pub use engine::{EngineTasks, InterceptEngine};
pub use error::EngineError;
pub use matcher::{matches, MatchMode, Matchable, MethodPattern, UrlPattern};
pub use mock::{apply_mock, MockOutcome};
pub use recorder::{EventRecorder, EventSink, InMemoryEventSink, RecorderStats};
pub use rules::{BreakpointRule, ChaosFault, ChaosRule, MockRule, MockTarget, Rule};
pub use store::{InMemoryRuleSource, RuleSnapshot, RuleSource, RuleStore};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
