//! End-to-end wire tests: signed JSON/1.0 requests against the full API
//! router, no network involved.

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::Router;
use burrowmq_server::tenant::TenantDirectory;
use burrowmq_server::{api_router, sigv4, AppState};
use burrowmq_storage::{InMemoryStore, QueueEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const AKID_A: &str = "AKIDALPHA";
const SECRET_A: &str = "alpha-secret";
const AKID_B: &str = "AKIDBRAVO";
const SECRET_B: &str = "bravo-secret";

fn app() -> Router {
    let engine = QueueEngine::new(Arc::new(InMemoryStore::new()));
    let tenants = TenantDirectory::new(1);
    tenants.insert(AKID_A, 1, SECRET_A);
    tenants.insert(AKID_B, 2, SECRET_B);
    api_router(AppState::new(engine, Arc::new(tenants), "us-east-1".into()))
}

fn signed_headers(op: &str, body: &[u8], akid: &str, secret: &str) -> HeaderMap {
    let uri: Uri = "/".parse().unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("host", "localhost".parse().unwrap());
    headers.insert(
        "x-amz-target",
        format!("AmazonSQS.{op}").parse().unwrap(),
    );
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        "application/x-amz-json-1.0".parse().unwrap(),
    );
    sigv4::sign("POST", &uri, &mut headers, body, akid, secret, "us-east-1");
    headers
}

async fn send_raw(
    app: &Router,
    headers: HeaderMap,
    body: Vec<u8>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method("POST").uri("/");
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    let req = builder.body(Body::from(body)).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn call_as(
    app: &Router,
    op: &str,
    body: Value,
    akid: &str,
    secret: &str,
) -> (StatusCode, Value) {
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = signed_headers(op, &bytes, akid, secret);
    send_raw(app, headers, bytes).await
}

async fn call(app: &Router, op: &str, body: Value) -> (StatusCode, Value) {
    call_as(app, op, body, AKID_A, SECRET_A).await
}

async fn create_queue(app: &Router, name: &str) -> String {
    let (status, resp) = call(app, "CreateQueue", json!({"QueueName": name})).await;
    assert_eq!(status, StatusCode::OK, "CreateQueue failed: {resp}");
    resp["QueueUrl"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_send_receive_delete() {
    let app = app();
    let url = create_queue(&app, "q1").await;
    assert!(url.ends_with("/q1"), "unexpected QueueUrl {url}");

    let (status, sent) = call(
        &app,
        "SendMessage",
        json!({"QueueUrl": url, "MessageBody": "hello world"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        sent["MD5OfMessageBody"].as_str().unwrap(),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );

    let (status, recv) = call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "MaxNumberOfMessages": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let msgs = recv["Messages"].as_array().unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["Body"], "hello world");
    assert_eq!(msgs[0]["MessageId"], msgs[0]["ReceiptHandle"]);
    assert_eq!(
        msgs[0]["MD5OfBody"].as_str().unwrap(),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );

    let receipt = msgs[0]["ReceiptHandle"].as_str().unwrap();
    let (status, _) = call(
        &app,
        "DeleteMessage",
        json!({"QueueUrl": url, "ReceiptHandle": receipt}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, recv) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    assert!(recv["Messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn visibility_timeout_redelivers() {
    let app = app();
    let url = create_queue(&app, "vis").await;
    call(&app, "SendMessage", json!({"QueueUrl": url, "MessageBody": "m"})).await;

    let (_, first) = call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "VisibilityTimeout": 1}),
    )
    .await;
    let id = first["Messages"][0]["MessageId"].as_str().unwrap().to_string();

    // still leased
    let (_, hidden) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    assert!(hidden["Messages"].as_array().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let (_, again) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    let msgs = again["Messages"].as_array().unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0]["MessageId"].as_str().unwrap(), id);
}

#[tokio::test]
async fn delayed_message_arrives_late() {
    let app = app();
    let url = create_queue(&app, "delay").await;
    call(
        &app,
        "SendMessage",
        json!({"QueueUrl": url, "MessageBody": "m", "DelaySeconds": 2}),
    )
    .await;

    let (_, now) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    assert!(now["Messages"].as_array().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let (_, later) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    assert_eq!(later["Messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tampered_body_is_forbidden() {
    let app = app();
    let signed_over = serde_json::to_vec(&json!({"QueueName": "x"})).unwrap();
    let headers = signed_headers("CreateQueue", &signed_over, AKID_A, SECRET_A);
    let tampered = serde_json::to_vec(&json!({"QueueName": "y"})).unwrap();

    let (status, resp) = send_raw(&app, headers, tampered).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(resp["__type"], "SignatureDoesNotMatch");
}

#[tokio::test]
async fn unsigned_request_is_rejected() {
    let app = app();
    let mut headers = HeaderMap::new();
    headers.insert("host", "localhost".parse().unwrap());
    headers.insert("x-amz-target", "AmazonSQS.ListQueues".parse().unwrap());
    let (status, resp) = send_raw(&app, headers, b"{}".to_vec()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(resp["__type"], "MissingAuthHeader");
}

#[tokio::test]
async fn tenants_cannot_see_each_other() {
    let app = app();
    let url = create_queue(&app, "qA").await;
    call(&app, "SendMessage", json!({"QueueUrl": url, "MessageBody": "private"})).await;

    let (_, listed) = call_as(&app, "ListQueues", json!({}), AKID_B, SECRET_B).await;
    assert!(listed["QueueUrls"].as_array().unwrap().is_empty());

    // same queue name through B's eyes does not exist, whatever the URL says
    let (status, resp) = call_as(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": "https://sqs.us-east-1.amazonaws.com/2/qA"}),
        AKID_B,
        SECRET_B,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["__type"], "QueueDoesNotExist");
}

#[tokio::test]
async fn url_tenant_segment_is_informational() {
    let app = app();
    create_queue(&app, "lenient").await;
    // wrong tenant id in the URL: the authenticated tenant wins
    let (status, _) = call(
        &app,
        "SendMessage",
        json!({
            "QueueUrl": "https://sqs.us-east-1.amazonaws.com/999/lenient",
            "MessageBody": "ok"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn attribute_roundtrip_with_digest() {
    let app = app();
    let url = create_queue(&app, "attrs").await;

    let (status, sent) = call(
        &app,
        "SendMessage",
        json!({
            "QueueUrl": url,
            "MessageBody": "payload",
            "MessageAttributes": {
                "foo": {"DataType": "Binary", "BinaryValue": "3q0="},
                "n": {"DataType": "Number", "StringValue": "42"}
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sent_digest = sent["MD5OfMessageAttributes"].as_str().unwrap().to_string();

    let (_, recv) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    let msg = &recv["Messages"][0];
    let attrs = &msg["MessageAttributes"];
    assert_eq!(attrs["foo"]["DataType"], "Binary");
    assert_eq!(attrs["foo"]["BinaryValue"], "3q0=");
    assert_eq!(attrs["n"]["DataType"], "Number");
    assert_eq!(attrs["n"]["StringValue"], "42");
    assert_eq!(msg["MD5OfMessageAttributes"].as_str().unwrap(), sent_digest);
}

#[tokio::test]
async fn batch_bounds_are_clamped() {
    let app = app();
    let url = create_queue(&app, "batch").await;
    for i in 0..12 {
        call(
            &app,
            "SendMessage",
            json!({"QueueUrl": url, "MessageBody": format!("m{i}")}),
        )
        .await;
    }

    let (_, ten) = call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "MaxNumberOfMessages": 100}),
    )
    .await;
    assert_eq!(ten["Messages"].as_array().unwrap().len(), 10);

    let (_, one) = call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "MaxNumberOfMessages": 0}),
    )
    .await;
    assert_eq!(one["Messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn delay_bound_is_enforced() {
    let app = app();
    let url = create_queue(&app, "bounds").await;

    let (status, _) = call(
        &app,
        "SendMessage",
        json!({"QueueUrl": url, "MessageBody": "edge", "DelaySeconds": 900}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, resp) = call(
        &app,
        "SendMessage",
        json!({"QueueUrl": url, "MessageBody": "over", "DelaySeconds": 901}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["__type"], "InvalidParameterValue");
}

#[tokio::test]
async fn unknown_operation_is_rejected() {
    let app = app();
    let (status, resp) = call(&app, "TeleportQueue", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["__type"], "UnknownOperation");
}

#[tokio::test]
async fn purge_and_queue_attributes() {
    let app = app();
    let url = create_queue(&app, "purge").await;
    for _ in 0..3 {
        call(&app, "SendMessage", json!({"QueueUrl": url, "MessageBody": "m"})).await;
    }

    let (_, attrs) = call(
        &app,
        "GetQueueAttributes",
        json!({"QueueUrl": url, "AttributeNames": ["All"]}),
    )
    .await;
    assert_eq!(attrs["Attributes"]["ApproximateNumberOfMessages"], "3");
    assert_eq!(attrs["Attributes"]["VisibilityTimeout"], "30");

    let (status, purged) = call(&app, "PurgeQueue", json!({"QueueUrl": url})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(purged["Success"], true);

    let (_, attrs) = call(
        &app,
        "GetQueueAttributes",
        json!({"QueueUrl": url, "AttributeNames": ["ApproximateNumberOfMessages"]}),
    )
    .await;
    assert_eq!(attrs["Attributes"]["ApproximateNumberOfMessages"], "0");
    assert!(attrs["Attributes"].get("VisibilityTimeout").is_none());
}

#[tokio::test]
async fn delete_queue_with_inflight_leases() {
    let app = app();
    let url = create_queue(&app, "doomed").await;
    call(&app, "SendMessage", json!({"QueueUrl": url, "MessageBody": "m"})).await;
    call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;

    let (status, _) = call(&app, "DeleteQueue", json!({"QueueUrl": url})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, resp) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["__type"], "QueueDoesNotExist");
}

#[tokio::test]
async fn duplicate_queue_is_reported() {
    let app = app();
    create_queue(&app, "dup").await;
    let (status, resp) = call(&app, "CreateQueue", json!({"QueueName": "dup"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["__type"], "QueueAlreadyExists");
}
