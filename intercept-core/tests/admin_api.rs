use axum::body::Body;
use axum::http::{Request, StatusCode};
use hub_common::{BreakpointRuleRecord, HttpExchange, RuleMeta, RuleRecord};
use intercept_core::{router, EngineConfig, InMemoryRuleSource, InterceptEngine};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn engine() -> Arc<InterceptEngine> {
    let source = Arc::new(InMemoryRuleSource::with_rules(vec![RuleRecord::Breakpoint(
        BreakpointRuleRecord {
            meta: RuleMeta::new("bp-1", "hold logins", 1),
            url_pattern: Some("/login".to_string()),
            method: Some("POST".to_string()),
            phase: "request".to_string(),
            timeout_ms: None,
        },
    )]));
    Arc::new(InterceptEngine::new(EngineConfig::default(), source).unwrap())
}

async fn call(engine: &Arc<InterceptEngine>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(json) => request.body(Body::from(json.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router(engine.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn hold_login(engine: &Arc<InterceptEngine>) -> (tokio::task::JoinHandle<intercept_core::Decision>, String) {
    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let exchange = HttpExchange::new("D1", "POST", "https://api.example.com/login")
                .with_body("user=ada");
            engine.on_http_request(exchange).await
        })
    };
    loop {
        if let Some(pending) = engine.pending_breakpoints().into_iter().next() {
            return (worker, pending.id);
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_health() {
    let engine = engine();
    let (status, body) = call(&engine, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_unknown_breakpoint_conflicts() {
    let engine = engine();
    for action in ["resume", "cancel"] {
        let (status, body) = call(&engine, "POST", &format!("/breakpoints/nope/{}", action), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_breakpoint_transition");
    }

    let (status, _) = call(&engine, "GET", "/breakpoints/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_and_edit_breakpoint() {
    let engine = engine();
    let (worker, id) = hold_login(&engine).await;

    let (status, body) = call(&engine, "GET", "/breakpoints", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], id.as_str());
    assert_eq!(body[0]["rule_id"], "bp-1");
    assert_eq!(body[0]["state"], "suspended");

    // "user=grace"
    let edit = serde_json::json!({ "body": "dXNlcj1ncmFjZQ==" });
    let (status, body) = call(&engine, "POST", &format!("/breakpoints/{}/edit", id), Some(edit)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "edited");

    let decision = worker.await.unwrap();
    assert!(decision.annotations.edited);
    assert_eq!(decision.unit.as_http().unwrap().request_body, b"user=grace");

    let (status, _) = call(&engine, "POST", &format!("/breakpoints/{}/resume", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_metrics_reflect_activity() {
    let engine = engine();
    let (worker, id) = hold_login(&engine).await;

    let (_, body) = call(&engine, "GET", "/metrics", None).await;
    assert_eq!(body["units_processed"], 1);
    assert_eq!(body["breakpoints"]["pending"], 1);

    let (status, _) = call(&engine, "POST", &format!("/breakpoints/{}/cancel", id), None).await;
    assert_eq!(status, StatusCode::OK);
    worker.await.unwrap();

    let (_, body) = call(&engine, "GET", "/metrics", None).await;
    assert_eq!(body["breakpoints"]["pending"], 0);
    assert_eq!(body["breakpoints"]["suspended"], 1);
}

#[tokio::test]
async fn test_push_invalidation_routes() {
    let engine = engine();
    let (status, _) = call(&engine, "POST", "/rules/bp-1/revoke", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // revoked rules no longer hold traffic
    let exchange = HttpExchange::new("D1", "POST", "https://api.example.com/login");
    let decision = engine.on_http_request(exchange).await;
    assert!(decision.breakpoint.is_none());

    let (status, _) = call(&engine, "POST", "/devices/D1/invalidate", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
