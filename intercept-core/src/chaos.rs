//! Chaos injection
//!
//! Every invocation draws one uniform sample and injects the rule's fault
//! when `sample < probability`. Samples are independent per unit, so the
//! observed rate only converges to the probability over many units.

use crate::config::ChaosConfig;
use crate::rules::{ChaosFault, ChaosRule};
use hub_common::TrafficUnit;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Source of uniform randomness
pub trait RandomSource: Send + Sync {
    /// Uniform in `[0, 1)`
    fn next_f64(&self) -> f64;
    fn next_u64(&self) -> u64;
}

/// Thread-local RNG, the default
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn next_u64(&self) -> u64 {
        rand::thread_rng().gen::<u64>()
    }
}

/// Reproducible sequence from a fixed seed
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.with_rng(|rng| rng.gen::<f64>())
    }

    fn next_u64(&self) -> u64 {
        self.with_rng(|rng| rng.gen::<u64>())
    }
}

/// What was actually injected
#[derive(Debug, Clone, PartialEq)]
pub enum ChaosEffect {
    Delay(Duration),
    ConnectionError(String),
    Status(u16),
    Truncated { original_len: usize, kept: usize },
    Corrupted { bytes: usize },
}

#[derive(Debug, Clone)]
pub struct ChaosOutcome {
    pub unit: TrafficUnit,
    /// `None` when the sample missed or chaos is switched off
    pub injected: Option<ChaosEffect>,
}

pub struct ChaosExecutor {
    random: Arc<dyn RandomSource>,
    enabled: bool,
}

impl ChaosExecutor {
    pub fn new(config: &ChaosConfig) -> Self {
        let random: Arc<dyn RandomSource> = match config.seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(ThreadRandom),
        };
        Self {
            random,
            enabled: config.enabled,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_source(Arc::new(SeededRandom::new(seed)))
    }

    pub fn with_source(random: Arc<dyn RandomSource>) -> Self {
        Self {
            random,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn sample(&self) -> f64 {
        self.random.next_f64()
    }

    pub fn apply_chaos(&self, rule: &ChaosRule, mut unit: TrafficUnit) -> ChaosOutcome {
        if !self.enabled || self.sample() >= rule.probability {
            return ChaosOutcome {
                unit,
                injected: None,
            };
        }

        let effect = match &rule.fault {
            ChaosFault::Latency {
                delay_ms,
                jitter_ms,
            } => {
                let jitter = match jitter_ms.checked_add(1) {
                    Some(1) => 0,
                    Some(span) => self.random.next_u64() % span,
                    // jitter_ms == u64::MAX covers the whole range
                    None => self.random.next_u64(),
                };
                Some(ChaosEffect::Delay(Duration::from_millis(
                    delay_ms.saturating_add(jitter),
                )))
            }
            ChaosFault::Error { message } => Some(ChaosEffect::ConnectionError(
                message
                    .clone()
                    .unwrap_or_else(|| "connection reset by chaos rule".to_string()),
            )),
            ChaosFault::Status { status_code, body } => match &mut unit {
                TrafficUnit::Http(exchange) => exchange.response.as_mut().map(|response| {
                    response.status_code = *status_code;
                    if let Some(body) = body {
                        response.body = body.clone().into_bytes();
                    }
                    ChaosEffect::Status(*status_code)
                }),
                TrafficUnit::Frame(_) => None,
            },
            ChaosFault::Truncate { keep_bytes } => {
                let payload = unit.payload_mut();
                let original_len = payload.len();
                payload.truncate(*keep_bytes);
                Some(ChaosEffect::Truncated {
                    original_len,
                    kept: payload.len(),
                })
            }
            ChaosFault::Corrupt { byte_count } => {
                let bytes = corrupt(unit.payload_mut(), *byte_count, self.random.as_ref());
                Some(ChaosEffect::Corrupted { bytes })
            }
        };

        if let Some(effect) = &effect {
            info!(
                rule_id = %rule.meta.id,
                unit_id = %unit.id(),
                fault = rule.fault.name(),
                "Injected chaos: {:?}",
                effect
            );
        }

        ChaosOutcome {
            unit,
            injected: effect,
        }
    }
}

/// Flip `count` distinct bytes, returning how many were changed
fn corrupt(payload: &mut [u8], count: usize, random: &dyn RandomSource) -> usize {
    let len = payload.len();
    let count = count.min(len);
    let mut positions: Vec<usize> = (0..len).collect();
    for i in 0..count {
        let j = i + (random.next_u64() % (len - i) as u64) as usize;
        positions.swap(i, j);
        let mask = (1 + random.next_u64() % 255) as u8;
        payload[positions[i]] ^= mask;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::{ChaosRuleRecord, Direction, HttpExchange, HttpResponse, Opcode, RuleMeta, WsFrame};

    fn rule(probability: f64, chaos_json: &str) -> ChaosRule {
        ChaosRule::compile(&ChaosRuleRecord {
            meta: RuleMeta::new("chaos-1", "chaos", 1),
            url_pattern: None,
            method: None,
            probability,
            chaos_json: chaos_json.to_string(),
        })
        .unwrap()
    }

    fn request() -> TrafficUnit {
        HttpExchange::new("D1", "GET", "https://api.example.com/items").into()
    }

    #[test]
    fn test_injection_rate_converges() {
        let executor = ChaosExecutor::seeded(7);
        let rule = rule(0.3, r#"{"type":"error"}"#);

        let trials = 10_000;
        let injected = (0..trials)
            .filter(|_| executor.apply_chaos(&rule, request()).injected.is_some())
            .count();
        let rate = injected as f64 / trials as f64;
        assert!((rate - 0.3).abs() < 0.02, "observed rate {}", rate);
    }

    #[test]
    fn test_probability_bounds() {
        let executor = ChaosExecutor::seeded(1);
        let never = rule(0.0, r#"{"type":"error"}"#);
        let always = rule(1.0, r#"{"type":"error","message":"boom"}"#);
        for _ in 0..500 {
            assert!(executor.apply_chaos(&never, request()).injected.is_none());
            assert_eq!(
                executor.apply_chaos(&always, request()).injected,
                Some(ChaosEffect::ConnectionError("boom".to_string()))
            );
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = ChaosExecutor::seeded(99);
        let b = ChaosExecutor::seeded(99);
        let samples_a: Vec<f64> = (0..20).map(|_| a.sample()).collect();
        let samples_b: Vec<f64> = (0..20).map(|_| b.sample()).collect();
        assert_eq!(samples_a, samples_b);
    }

    #[test]
    fn test_disabled_executor_never_injects() {
        let executor = ChaosExecutor::new(&ChaosConfig {
            enabled: false,
            seed: Some(3),
        });
        let rule = rule(1.0, r#"{"type":"error"}"#);
        assert!(executor.apply_chaos(&rule, request()).injected.is_none());
    }

    #[test]
    fn test_latency_with_jitter() {
        let executor = ChaosExecutor::seeded(5);
        let rule = rule(1.0, r#"{"type":"latency","delay_ms":100,"jitter_ms":50}"#);
        for _ in 0..100 {
            match executor.apply_chaos(&rule, request()).injected {
                Some(ChaosEffect::Delay(d)) => {
                    assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150))
                }
                other => panic!("expected delay, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_latency_with_extreme_values_saturates() {
        let executor = ChaosExecutor::seeded(1);
        let max = u64::MAX;
        let rule = rule(
            1.0,
            &format!(r#"{{"type":"latency","delay_ms":{},"jitter_ms":{}}}"#, max, max),
        );
        for _ in 0..50 {
            assert_eq!(
                executor.apply_chaos(&rule, request()).injected,
                Some(ChaosEffect::Delay(Duration::from_millis(u64::MAX)))
            );
        }

        let rule = rule_with_jitter(1, u64::MAX);
        match executor.apply_chaos(&rule, request()).injected {
            Some(ChaosEffect::Delay(d)) => assert!(d >= Duration::from_millis(1)),
            other => panic!("expected delay, got {:?}", other),
        }
    }

    fn rule_with_jitter(delay_ms: u64, jitter_ms: u64) -> ChaosRule {
        rule(
            1.0,
            &format!(r#"{{"type":"latency","delay_ms":{},"jitter_ms":{}}}"#, delay_ms, jitter_ms),
        )
    }

    #[test]
    fn test_status_and_truncate_on_response() {
        let executor = ChaosExecutor::seeded(5);
        let response_unit = || -> TrafficUnit {
            HttpExchange::new("D1", "GET", "/page")
                .with_response(HttpResponse::new(200).with_body("0123456789"))
                .into()
        };

        let status = rule(1.0, r#"{"type":"status","status_code":503,"body":"down"}"#);
        let outcome = executor.apply_chaos(&status, response_unit());
        assert_eq!(outcome.injected, Some(ChaosEffect::Status(503)));
        let response = outcome.unit.as_http().unwrap().response.clone().unwrap();
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body, b"down");

        let truncate = rule(1.0, r#"{"type":"truncate","keep_bytes":4}"#);
        let outcome = executor.apply_chaos(&truncate, response_unit());
        assert_eq!(
            outcome.injected,
            Some(ChaosEffect::Truncated {
                original_len: 10,
                kept: 4
            })
        );
        assert_eq!(outcome.unit.as_http().unwrap().response.as_ref().unwrap().body, b"0123");
    }

    #[test]
    fn test_corrupt_frame_flips_distinct_bytes() {
        let executor = ChaosExecutor::seeded(11);
        let rule = rule(1.0, r#"{"type":"corrupt","byte_count":3}"#);
        let original = vec![0u8; 16];
        let frame = WsFrame::new("D1", "s-1", "wss://x/socket", Direction::Outbound, Opcode::Binary, original.clone());

        let outcome = executor.apply_chaos(&rule, frame.into());
        assert_eq!(outcome.injected, Some(ChaosEffect::Corrupted { bytes: 3 }));
        let changed = outcome
            .unit
            .as_frame()
            .unwrap()
            .payload
            .iter()
            .zip(&original)
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(changed, 3);
    }
}
