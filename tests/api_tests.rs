
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use jobmesh::api::{router, ApiState};
use test_harness::{server_scheduler, test_config};

/// Create a test app over a fresh server-style scheduler
fn create_test_app() -> Router {
    let (scheduler, events) = server_scheduler(test_config());
    router(ApiState { scheduler, events })
}

fn request(method: &str, uri: &str, requester: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(id) = requester {
        builder = builder.header("x-requester-id", id);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn submit_job(app: &Router, requester: &str, body: Value) -> Value {
    let (status, job) = send(app, request("POST", "/api/jobs", Some(requester), Some(body))).await;
    assert_eq!(status, StatusCode::CREATED, "submit failed: {job}");
    job
}

async fn register_node(app: &Router, node_id: &str) {
    let (status, _) = send(
        app,
        request(
            "POST",
            "/api/nodes/register",
            None,
            Some(json!({"node_id": node_id, "hostname": "worker.local", "capabilities": ["ocr"]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_submit_job_applies_defaults() {
    let app = create_test_app();
    let job = submit_job(&app, "alice", json!({"type": "ocr", "parameters": {"lang": "en"}})).await;

    assert_eq!(job["type"], "ocr");
    assert_eq!(job["status"], "queued");
    assert_eq!(job["priority"], 5);
    assert_eq!(job["max_retries"], 3);
    assert_eq!(job["timeout_seconds"], 3600);
    assert_eq!(job["submitted_by"], "alice");
    assert_eq!(job["parameters"]["lang"], "en");
}

#[tokio::test]
async fn test_submit_invalid_priority_returns_400() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/jobs",
            Some("alice"),
            Some(json!({"job_type": "ocr", "priority": 11})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SPEC");
}

#[tokio::test]
async fn test_submit_out_of_range_fields_return_400() {
    let app = create_test_app();
    for body in [
        json!({"type": "ocr", "priority": 300}),
        json!({"type": "ocr", "max_retries": -1}),
        json!({"type": "ocr", "timeout_seconds": "soon"}),
        json!({"priority": 5}),
    ] {
        let (status, error) =
            send(&app, request("POST", "/api/jobs", Some("alice"), Some(body.clone()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body} gave {error}");
        assert_eq!(error["error"], "INVALID_SPEC");
    }
}

#[tokio::test]
async fn test_malformed_body_returns_400() {
    let app = create_test_app();
    let malformed = Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header("x-requester-id", "alice")
        .header("content-type", "application/json")
        .body(Body::from("{\"type\": \"ocr\""))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SPEC");

    let untyped = Request::builder()
        .method("POST")
        .uri("/api/nodes/register")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&app, untyped).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SPEC");
}

#[tokio::test]
async fn test_malformed_query_returns_400() {
    let app = create_test_app();
    for uri in ["/api/jobs?limit=abc", "/api/jobs?offset=-1"] {
        let (status, body) = send(&app, request("GET", uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"], "INVALID_SPEC");
    }

    let (status, body) = send(&app, request("GET", "/api/nodes?limit=many", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SPEC");
}

#[tokio::test]
async fn test_queue_full_returns_503() {
    let (scheduler, events) = server_scheduler(test_config().with_max_queue_size(1));
    let app = router(ApiState { scheduler, events });
    submit_job(&app, "alice", json!({"type": "ocr"})).await;

    let overflow = request("POST", "/api/jobs", Some("alice"), Some(json!({"type": "ocr"})));
    let (status, body) = send(&app, overflow).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "QUEUE_FULL");
}

#[tokio::test]
async fn test_get_job_enforces_ownership() {
    let app = create_test_app();
    let job = submit_job(&app, "alice", json!({"type": "ocr"})).await;
    let uri = format!("/api/jobs/{}", job["id"].as_str().unwrap());

    let (status, _) = send(&app, request("GET", &uri, Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request("GET", &uri, Some("bob"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");

    let admin = Request::builder()
        .method("GET")
        .uri(&uri)
        .header("x-requester-id", "ops")
        .header("x-requester-role", "admin")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, admin).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_get_unknown_and_malformed_job() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        request("GET", &format!("/api/jobs/{}", uuid::Uuid::new_v4()), Some("alice"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let (status, _) = send(&app, request("GET", "/api/jobs/not-a-uuid", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_jobs_scoped_to_requester() {
    let app = create_test_app();
    submit_job(&app, "alice", json!({"type": "ocr", "tags": ["invoices"]})).await;
    submit_job(&app, "alice", json!({"type": "pdf_parse"})).await;
    submit_job(&app, "bob", json!({"type": "ocr"})).await;

    let (status, page) = send(&app, request("GET", "/api/jobs", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);

    let by_tags = request("GET", "/api/jobs?tags=invoices,other", Some("alice"), None);
    let (_, page) = send(&app, by_tags).await;
    assert_eq!(page["total"], 1);

    let by_status = request("GET", "/api/jobs?status=queued&type=ocr", Some("alice"), None);
    let (_, page) = send(&app, by_status).await;
    assert_eq!(page["total"], 1);

    let unknown_status = request("GET", "/api/jobs?status=sleeping", Some("alice"), None);
    let (status, _) = send(&app, unknown_status).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_claim_progress_and_result_flow() {
    let app = create_test_app();
    register_node(&app, "n1").await;
    let job = submit_job(&app, "alice", json!({"type": "ocr"})).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    let (status, claimed) = send(
        &app,
        request(
            "POST",
            "/api/jobs/request",
            None,
            Some(json!({"node_id": "n1", "capacity": 2, "capabilities": ["ocr"]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(claimed["jobs"][0]["status"], "assigned");
    assert_eq!(claimed["jobs"][0]["assigned_node_id"], "n1");

    let (status, progressed) = send(
        &app,
        request(
            "POST",
            &format!("/api/jobs/{job_id}/progress"),
            None,
            Some(json!({"node_id": "n1", "progress": 40.0, "message": "page 4/10"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progressed["status"], "processing");
    assert_eq!(progressed["status_message"], "page 4/10");

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/jobs/{job_id}/result"),
            None,
            Some(json!({"job_id": job_id, "node_id": "n2", "status": "completed", "result": {}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "NODE_MISMATCH");

    let (status, done) = send(
        &app,
        request(
            "POST",
            &format!("/api/jobs/{job_id}/result"),
            None,
            Some(json!({
                "job_id": job_id,
                "node_id": "n1",
                "status": "completed",
                "result": {"pages": 10},
                "processing_time_seconds": 8.0
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "completed");
    assert_eq!(done["executed_by"], "n1");

    let (_, node) = send(&app, request("GET", "/api/nodes/n1", None, None)).await;
    assert_eq!(node["total_jobs_processed"], 1);
}

#[tokio::test]
async fn test_result_with_mismatched_job_id_rejected() {
    let app = create_test_app();
    let path_id = uuid::Uuid::new_v4();
    let body_id = uuid::Uuid::new_v4();
    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/jobs/{path_id}/result"),
            None,
            Some(json!({"job_id": body_id, "node_id": "n1", "status": "completed"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SPEC");
}

#[tokio::test]
async fn test_cancel_via_delete() {
    let app = create_test_app();
    let job = submit_job(&app, "alice", json!({"type": "ocr"})).await;
    let uri = format!("/api/jobs/{}", job["id"].as_str().unwrap());

    let (status, _) = send(&app, request("DELETE", &uri, Some("bob"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, canceled) = send(&app, request("DELETE", &uri, Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["status"], "canceled");

    let (status, body) = send(&app, request("DELETE", &uri, Some("alice"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "INVALID_STATE");
}

#[tokio::test]
async fn test_heartbeat_and_node_listing() {
    let app = create_test_app();
    register_node(&app, "n1").await;
    register_node(&app, "n2").await;

    let (status, node) = send(
        &app,
        request(
            "POST",
            "/api/nodes/heartbeat",
            None,
            Some(json!({
                "node_id": "n1",
                "status": "busy",
                "current_load": {
                    "cpu_percent": 90.0,
                    "memory_percent": 40.0,
                    "available_memory_mb": 1024,
                    "active_jobs": 3
                }
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["status"], "busy");
    assert_eq!(node["current_load"]["active_jobs"], 3);

    let (_, page) = send(&app, request("GET", "/api/nodes?status=online", None, None)).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["id"], "n2");

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/nodes/heartbeat",
            None,
            Some(json!({"node_id": "ghost", "status": "online"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_queue_stats_endpoint() {
    let app = create_test_app();
    submit_job(&app, "alice", json!({"type": "ocr", "priority": 9})).await;
    submit_job(&app, "alice", json!({"type": "ocr", "priority": 2})).await;

    let (status, stats) = send(&app, request("GET", "/api/queue/stats", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["queue_size"], 2);
    assert_eq!(stats["high_priority"], 1);
    assert_eq!(stats["low_priority"], 1);
    assert_eq!(stats["capacity"], 100);
}
