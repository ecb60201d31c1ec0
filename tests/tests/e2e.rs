//! End-to-end scenarios over the full HTTP surface.

use axum::http::{header, StatusCode};
use futures::StreamExt;
use maestro_testing::{body_json, get, post_json, test_app, TestApp};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

/// Poll the JSON history endpoint until `predicate` holds over the event
/// list, or fail after a few seconds.
async fn wait_for_history(
    app: &TestApp,
    plan_id: &str,
    bearer: Option<&str>,
    predicate: impl Fn(&[Value]) -> bool,
) -> Vec<Value> {
    timeout(Duration::from_secs(5), async {
        loop {
            let response = app
                .request(get(&format!("/plan/{plan_id}/events"), bearer, None))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            let events = body["events"].as_array().cloned().unwrap_or_default();
            if predicate(&events) {
                return events;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("timed out waiting for plan events")
}

fn has_state(events: &[Value], step_id: &str, state: &str) -> bool {
    events
        .iter()
        .any(|e| e["step"]["id"] == step_id && e["step"]["state"] == state)
}

// ---------------------------------------------------------------------------
// Scenario 1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_plan_runs_to_completion() {
    let app = test_app(|_| {}).await;

    let response = app
        .request(post_json("/plan", &json!({"goal": "launch feature"}), None))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-trace-id"));

    let body = body_json(response).await;
    let plan_id = body["plan"]["id"].as_str().unwrap().to_string();
    let steps = body["plan"]["steps"].as_array().unwrap();
    assert!(!steps.is_empty());
    let first_step_id = steps[0]["id"].as_str().unwrap().to_string();
    assert!(body["requestId"].is_string());
    assert!(body["traceId"].is_string());

    let events = wait_for_history(&app, &plan_id, None, |events| {
        has_state(events, &first_step_id, "completed")
    })
    .await;

    // The first event belongs to the first step in queued or running state.
    let first = &events[0];
    assert_eq!(first["event"], "plan.step");
    assert_eq!(first["step"]["id"], first_step_id.as_str());
    assert!(matches!(
        first["step"]["state"].as_str().unwrap(),
        "queued" | "running"
    ));
}

#[tokio::test]
async fn history_endpoint_sets_no_cache_headers() {
    let app = test_app(|_| {}).await;
    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "cache test"}), None))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap();

    let response = app
        .request(get(&format!("/plan/{plan_id}/events"), None, None))
        .await;
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");
}

// ---------------------------------------------------------------------------
// Scenario: SSE live stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_stream_replays_history_and_forwards_live_events() {
    let app = test_app(|_| {}).await;
    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "stream me"}), None))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap().to_string();

    let response = app
        .request(get(
            &format!("/plan/{plan_id}/events"),
            None,
            Some("text/event-stream"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Read frames until a completed event for step-1 arrives.
    let mut stream = response.into_body().into_data_stream();
    let mut collected = String::new();
    timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            collected.push_str(std::str::from_utf8(&chunk).unwrap());
            if collected.contains("\"state\":\"completed\"") {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for completed event on the SSE stream");

    assert!(collected.contains("event: plan.step"));
    assert!(collected.contains("\"event\":\"plan.step\""));
}

// ---------------------------------------------------------------------------
// Scenario 3: subject mismatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subject_mismatch_is_forbidden() {
    let app = test_app(|_| {}).await;
    let session_a = app.session("user-a", "tenant-1", None);
    let session_b = app.session("user-b", "tenant-1", None);

    let body = body_json(
        app.request(post_json(
            "/plan",
            &json!({"goal": "private plan"}),
            Some(&session_a),
        ))
        .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap();

    let response = app
        .request(get(&format!("/plan/{plan_id}/events"), Some(&session_b), None))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "forbidden");
    assert_eq!(body["message"], "subject does not match plan owner");
}

#[tokio::test]
async fn same_user_after_session_rotation_can_read() {
    let app = test_app(|_| {}).await;
    let session_x = app.session("user-u", "tenant-1", None);
    let session_y = app.session("user-u", "tenant-1", None);

    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "rotate"}), Some(&session_x)))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap();

    let response = app
        .request(get(&format!("/plan/{plan_id}/events"), Some(&session_y), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Scenario 4: approval with a rotated session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rotated_session_can_approve_and_step_is_released() {
    let app = test_app(|_| {}).await;
    let session_x = app.session("user-u", "tenant-1", None);
    let session_y = app.session("user-u", "tenant-1", None);

    let body = body_json(
        app.request(post_json(
            "/plan",
            &json!({
                "goal": "guarded deploy",
                "steps": [
                    {"id": "gate", "action": "deploy to prod", "tool": "agent.run",
                     "approval_required": true},
                    {"id": "verify", "action": "verify deploy", "tool": "agent.run"}
                ]
            }),
            Some(&session_x),
        ))
        .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap().to_string();

    wait_for_history(&app, &plan_id, Some(&session_x), |events| {
        has_state(events, "gate", "waiting_approval")
    })
    .await;

    let response = app
        .request(post_json(
            &format!("/plan/{plan_id}/steps/gate/approve"),
            &json!({"rationale": "reviewed"}),
            Some(&session_y),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // A downstream queued event is published and the plan completes.
    let events = wait_for_history(&app, &plan_id, Some(&session_x), |events| {
        has_state(events, "verify", "completed")
    })
    .await;
    assert!(events
        .iter()
        .any(|e| e["step"]["id"] == "gate"
            && e["step"]["state"] == "queued"
            && e["step"]["summary"] == "Approved: reviewed"));
}

#[tokio::test]
async fn approval_from_different_user_is_forbidden() {
    let app = test_app(|_| {}).await;
    let owner = app.session("user-a", "tenant-1", None);
    let intruder = app.session("user-b", "tenant-1", None);

    let body = body_json(
        app.request(post_json(
            "/plan",
            &json!({
                "goal": "guarded",
                "steps": [{"id": "gate", "action": "x", "tool": "agent.run",
                           "approval_required": true}]
            }),
            Some(&owner),
        ))
        .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap();

    let response = app
        .request(post_json(
            &format!("/plan/{plan_id}/steps/gate/approve"),
            &json!({}),
            Some(&intruder),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["message"], "approval subject mismatch");
}

// ---------------------------------------------------------------------------
// Scenario 5: approval state conflict
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approving_a_non_pending_step_conflicts() {
    let app = test_app(|_| {}).await;
    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "no gate"}), None))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap().to_string();

    // step-1 starts immediately (queued/running, never waiting_approval).
    let response = app
        .request(post_json(
            &format!("/plan/{plan_id}/steps/step-1/approve"),
            &json!({}),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "conflict");
    assert_eq!(body["message"], "step is not awaiting approval");
}

#[tokio::test]
async fn unknown_step_approval_is_not_found() {
    let app = test_app(|_| {}).await;
    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "g"}), None))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap();

    let response = app
        .request(post_json(
            &format!("/plan/{plan_id}/steps/ghost/approve"),
            &json!({}),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Scenario 6: SSE quota
// ---------------------------------------------------------------------------

#[tokio::test]
async fn third_sse_connection_from_one_ip_is_rejected() {
    let app = test_app(|cfg| {
        cfg.server.sse_quotas.per_ip = 2;
        cfg.server.sse_quotas.per_subject = 10;
    })
    .await;
    let body = body_json(
        app.request(post_json("/plan", &json!({"goal": "quota"}), None))
            .await,
    )
    .await;
    let plan_id = body["plan"]["id"].as_str().unwrap().to_string();

    let sse_request = |ip: &str| {
        axum::http::Request::get(format!("/plan/{plan_id}/events"))
            .header(header::ACCEPT, "text/event-stream")
            .header("x-forwarded-for", ip.to_string())
            .body(axum::body::Body::empty())
            .unwrap()
    };

    // Two concurrent streams hold their quota slots while alive.
    let first = app.request(sse_request("203.0.113.7")).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.request(sse_request("203.0.113.7")).await;
    assert_eq!(second.status(), StatusCode::OK);

    let third = app.request(sse_request("203.0.113.7")).await;
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(third).await;
    assert_eq!(body["code"], "too_many_requests");

    // A different ip is unaffected.
    let other = app.request(sse_request("203.0.113.8")).await;
    assert_eq!(other.status(), StatusCode::OK);

    // Releasing a slot re-admits the ip.
    drop(first);
    timeout(Duration::from_secs(2), async {
        loop {
            if app.state.sse_quota.ip_count("203.0.113.7") < 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("quota slot should release when the stream drops");
    let readmitted = app.request(sse_request("203.0.113.7")).await;
    assert_eq!(readmitted.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Rate limiting, auth, validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plan_creation_is_rate_limited() {
    let app = test_app(|cfg| {
        cfg.server.rate_limits.plan.window_ms = 60_000;
        cfg.server.rate_limits.plan.max_requests = 2;
    })
    .await;

    for _ in 0..2 {
        let response = app
            .request(post_json("/plan", &json!({"goal": "ok"}), None))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let response = app
        .request(post_json("/plan", &json!({"goal": "ok"}), None))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["code"], "too_many_requests");
    assert!(body["details"]["retryAfterMs"].is_number());
}

#[tokio::test]
async fn missing_session_in_oidc_mode_is_unauthorized() {
    let app = test_app(|cfg| {
        cfg.auth.oidc.enabled = true;
    })
    .await;

    let response = app
        .request(post_json("/plan", &json!({"goal": "needs auth"}), None))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn invalid_goal_yields_field_issues() {
    let app = test_app(|_| {}).await;
    let response = app
        .request(post_json("/plan", &json!({"goal": "   "}), None))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(body["details"][0]["path"], "goal");
}

#[tokio::test]
async fn malformed_plan_id_is_rejected() {
    let app = test_app(|_| {}).await;
    let response = app.request(get("/plan/not-a-plan/events", None, None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_plan_is_not_found() {
    let app = test_app(|_| {}).await;
    let response = app
        .request(get("/plan/plan-abc12345/events", None, None))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Surface behavior: ids, CORS, security headers, health, metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_valid_ids_are_honoured() {
    let app = test_app(|_| {}).await;
    let request = axum::http::Request::get("/healthz")
        .header("x-request-id", "req-12345678")
        .header("x-trace-id", "trace-12345678")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.request(request).await;
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-12345678");
    assert_eq!(response.headers().get("x-trace-id").unwrap(), "trace-12345678");
}

#[tokio::test]
async fn untrusted_origin_gets_no_cors_headers() {
    let app = test_app(|cfg| {
        cfg.server.cors.allowed_origins = vec!["https://app.example.com".to_string()];
    })
    .await;

    let trusted = app
        .request(
            axum::http::Request::get("/healthz")
                .header(header::ORIGIN, "https://app.example.com")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(
        trusted
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "https://app.example.com"
    );

    let untrusted = app
        .request(
            axum::http::Request::get("/healthz")
                .header(header::ORIGIN, "https://evil.example.com")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(untrusted.status(), StatusCode::OK);
    assert!(untrusted
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
    assert!(untrusted
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
        .is_none());
}

#[tokio::test]
async fn security_headers_are_always_set() {
    let app = test_app(|_| {}).await;
    let response = app.request(get("/healthz", None, None)).await;
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert!(response.headers().contains_key("content-security-policy"));
}

#[tokio::test]
async fn health_ready_and_metrics_respond() {
    let app = test_app(|_| {}).await;
    // Seed one enqueue so the counter family has a child to export.
    app.request(post_json("/plan", &json!({"goal": "metrics seed"}), None))
        .await;

    let health = body_json(app.request(get("/healthz", None, None)).await).await;
    assert_eq!(health["status"], "ok");

    let ready = body_json(app.request(get("/readyz", None, None)).await).await;
    assert_eq!(ready["status"], "ok");
    assert!(ready["uptimeSeconds"].is_number());
    assert_eq!(ready["details"]["queue"]["status"], "ok");
    assert!(ready["requestId"].is_string());

    let metrics = app.request(get("/metrics", None, None)).await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = axum::body::to_bytes(metrics.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(text.to_vec()).unwrap();
    assert!(text.contains("maestro_queue_enqueue_total"));
}

#[tokio::test]
async fn chat_endpoint_validates_then_surfaces_upstream_error() {
    let app = test_app(|_| {}).await;

    let invalid = app
        .request(post_json(
            "/chat",
            &json!({"messages": [{"role": "robot", "content": "hi"}]}),
            None,
        ))
        .await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    // Valid body, but no provider is configured in the test harness.
    let unrouted = app
        .request(post_json(
            "/chat",
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
            None,
        ))
        .await;
    assert_eq!(unrouted.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(unrouted).await;
    assert_eq!(body["code"], "upstream_error");
}
