//! JSON/1.0 protocol adapter: `X-Amz-Target` dispatch, wire <-> engine
//! translation and the MD5 digests clients check.

use crate::metrics::{AUTH_FAILURES_TOTAL, ERRORS_TOTAL, OPS_TOTAL, OP_DURATION};
use crate::sigv4::{self, AuthError};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as b64, Engine};
use burrowmq_core::{
    util::md5_hex, AttrValue, Attributes, Message, QueueError, TenantId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";

#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    UnknownOperation(String),
    Engine(QueueError),
    BadRequest(String),
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::FORBIDDEN,
            ApiError::UnknownOperation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(QueueError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn aws_type(&self) -> &'static str {
        match self {
            ApiError::Auth(AuthError::MissingAuthHeader) => "MissingAuthHeader",
            ApiError::Auth(AuthError::MalformedAuthHeader) => "MalformedAuthHeader",
            ApiError::Auth(AuthError::UnsupportedSignatureVersion) => {
                "UnsupportedSignatureVersion"
            }
            ApiError::Auth(AuthError::UnknownAccessKey) => "UnknownAccessKey",
            ApiError::Auth(AuthError::SignatureDoesNotMatch) => "SignatureDoesNotMatch",
            ApiError::UnknownOperation(_) => "UnknownOperation",
            ApiError::Engine(QueueError::QueueNotFound) => "QueueDoesNotExist",
            ApiError::Engine(QueueError::QueueAlreadyExists) => "QueueAlreadyExists",
            ApiError::Engine(QueueError::Internal(_)) => "InternalFailure",
            ApiError::Engine(_) | ApiError::BadRequest(_) => "InvalidParameterValue",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Auth(e) => e.to_string(),
            ApiError::UnknownOperation(op) => format!("unknown operation {op:?}"),
            ApiError::Engine(e) => e.to_string(),
            ApiError::BadRequest(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        ERRORS_TOTAL.with_label_values(&[self.aws_type()]).inc();
        let body = json!({"__type": self.aws_type(), "message": self.message()});
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, CONTENT_TYPE)],
            axum::Json(body),
        )
            .into_response()
    }
}

/// Entry point for every API request: SigV4, then target dispatch.
pub async fn handle_api(
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let tenant = match sigv4::verify("POST", &uri, &headers, &body, &app.tenants) {
        Ok(t) => t,
        Err(e) => {
            AUTH_FAILURES_TOTAL
                .with_label_values(&[match e {
                    AuthError::MissingAuthHeader => "missing",
                    AuthError::MalformedAuthHeader => "malformed",
                    AuthError::UnsupportedSignatureVersion => "version",
                    AuthError::UnknownAccessKey => "unknown_key",
                    AuthError::SignatureDoesNotMatch => "mismatch",
                }])
                .inc();
            return ApiError::Auth(e).into_response();
        }
    };

    let op = match headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .and_then(|t| t.strip_prefix(TARGET_PREFIX))
    {
        Some(op) => op.to_string(),
        None => return ApiError::UnknownOperation("<missing target>".into()).into_response(),
    };

    OPS_TOTAL.with_label_values(&[op.as_str()]).inc();
    let timer = OP_DURATION.with_label_values(&[op.as_str()]).start_timer();
    let result = dispatch(&app, tenant, &op, &body).await;
    timer.observe_duration();

    match result {
        Ok(v) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, CONTENT_TYPE)],
            axum::Json(v),
        )
            .into_response(),
        Err(e) => {
            tracing::debug!(op = %op, tenant, error = %e.message(), "request failed");
            e.into_response()
        }
    }
}

async fn dispatch(
    app: &AppState,
    tenant: TenantId,
    op: &str,
    body: &[u8],
) -> Result<serde_json::Value, ApiError> {
    match op {
        "ListQueues" => list_queues(app, tenant, parse(body)?).await,
        "CreateQueue" => create_queue(app, tenant, parse(body)?).await,
        "DeleteQueue" => delete_queue(app, tenant, parse(body)?).await,
        "PurgeQueue" => purge_queue(app, tenant, parse(body)?).await,
        "GetQueueAttributes" => get_queue_attributes(app, tenant, parse(body)?).await,
        "SendMessage" => send_message(app, tenant, parse(body)?).await,
        "ReceiveMessage" => receive_message(app, tenant, parse(body)?).await,
        "DeleteMessage" => delete_message(app, tenant, parse(body)?).await,
        other => Err(ApiError::UnknownOperation(other.to_string())),
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.is_empty() { b"{}".as_slice() } else { body };
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("malformed request body: {e}")))
}

/// The queue name is the final path segment; the tenant segment in the URL
/// is informational only and the authenticated tenant always wins.
pub fn queue_name_from_url(url: &str) -> Result<String, ApiError> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::BadRequest(format!("cannot derive queue name from {url:?}")))
}

pub fn queue_url(region: &str, tenant: TenantId, name: &str) -> String {
    format!("https://sqs.{region}.amazonaws.com/{tenant}/{name}")
}

// ---- wire shapes ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListQueuesRequest {
    queue_name_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CreateQueueRequest {
    queue_name: String,
    attributes: Option<BTreeMap<String, String>>,
    #[allow(dead_code)]
    tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueUrlRequest {
    queue_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueAttributesRequest {
    queue_url: String,
    #[serde(default)]
    attribute_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageRequest {
    queue_url: String,
    message_body: String,
    #[serde(default)]
    delay_seconds: Option<u32>,
    #[serde(default)]
    message_attributes: Option<BTreeMap<String, WireAttribute>>,
    // accepted on the wire, ignored by the standard-queue engine
    #[serde(default)]
    #[allow(dead_code)]
    message_deduplication_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    message_group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest {
    queue_url: String,
    #[serde(default)]
    max_number_of_messages: Option<u32>,
    #[serde(default)]
    visibility_timeout: Option<u32>,
    #[serde(default)]
    wait_time_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest {
    queue_url: String,
    receipt_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireAttribute {
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary_value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
    #[serde(rename = "MD5OfBody")]
    md5_of_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_attributes: Option<BTreeMap<String, WireAttribute>>,
    #[serde(rename = "MD5OfMessageAttributes", skip_serializing_if = "Option::is_none")]
    md5_of_message_attributes: Option<String>,
}

// ---- attribute translation ----

pub fn decode_attributes(
    wire: Option<BTreeMap<String, WireAttribute>>,
) -> Result<Attributes, ApiError> {
    let mut out = Attributes::default();
    for (name, attr) in wire.unwrap_or_default() {
        let value = match (attr.data_type.as_str(), attr.string_value, attr.binary_value) {
            ("String", Some(s), None) => AttrValue::String(s),
            ("Number", Some(s), None) => AttrValue::Number(s),
            ("Binary", None, Some(enc)) => {
                let bytes = b64.decode(enc.as_bytes()).map_err(|_| {
                    ApiError::BadRequest(format!("attribute {name:?}: BinaryValue is not base64"))
                })?;
                AttrValue::Binary(bytes)
            }
            (dt, _, _) => {
                return Err(ApiError::BadRequest(format!(
                    "attribute {name:?}: unsupported DataType {dt:?} or mismatched value field"
                )))
            }
        };
        out.0.insert(name, value);
    }
    Ok(out)
}

pub fn encode_attributes(attrs: &Attributes) -> Option<BTreeMap<String, WireAttribute>> {
    if attrs.is_empty() {
        return None;
    }
    let mut out = BTreeMap::new();
    for (name, value) in attrs.0.iter() {
        let wire = match value {
            AttrValue::String(s) => WireAttribute {
                data_type: "String".into(),
                string_value: Some(s.clone()),
                binary_value: None,
            },
            AttrValue::Number(s) => WireAttribute {
                data_type: "Number".into(),
                string_value: Some(s.clone()),
                binary_value: None,
            },
            AttrValue::Binary(bytes) => WireAttribute {
                data_type: "Binary".into(),
                string_value: None,
                binary_value: Some(b64.encode(bytes)),
            },
        };
        out.insert(name.clone(), wire);
    }
    Some(out)
}

/// AWS attribute digest: names in lexicographic order, each field prefixed
/// with its u32 big-endian length, plus a transport byte (1 textual,
/// 2 binary) before the value.
pub fn md5_of_attributes(attrs: &Attributes) -> String {
    let mut buf = Vec::new();
    for (name, value) in attrs.0.iter() {
        push_len_prefixed(&mut buf, name.as_bytes());
        push_len_prefixed(&mut buf, value.data_type().as_bytes());
        buf.push(value.transport_byte());
        push_len_prefixed(&mut buf, value.raw_bytes());
    }
    md5_hex(&buf)
}

fn push_len_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn to_wire_message(msg: &Message) -> WireMessage {
    let digest = if msg.attributes.is_empty() {
        None
    } else {
        Some(md5_of_attributes(&msg.attributes))
    };
    WireMessage {
        message_id: msg.id.to_string(),
        receipt_handle: msg.id.to_string(),
        body: String::from_utf8_lossy(&msg.body).into_owned(),
        md5_of_body: md5_hex(&msg.body),
        message_attributes: encode_attributes(&msg.attributes),
        md5_of_message_attributes: digest,
    }
}

// ---- operations ----

async fn list_queues(
    app: &AppState,
    tenant: TenantId,
    req: ListQueuesRequest,
) -> Result<serde_json::Value, ApiError> {
    let names = app.engine.list_queues(tenant).await?;
    let prefix = req.queue_name_prefix.unwrap_or_default();
    let urls: Vec<String> = names
        .iter()
        .filter(|n| n.starts_with(&prefix))
        .map(|n| queue_url(&app.region, tenant, n))
        .collect();
    Ok(json!({ "QueueUrls": urls }))
}

async fn create_queue(
    app: &AppState,
    tenant: TenantId,
    req: CreateQueueRequest,
) -> Result<serde_json::Value, ApiError> {
    let attrs = req.attributes.unwrap_or_default();
    let visibility = parse_numeric_attr(&attrs, "VisibilityTimeout")?;
    let delay = parse_numeric_attr(&attrs, "DelaySeconds")?;
    let cfg = app
        .engine
        .create_queue(tenant, &req.queue_name, visibility, delay)
        .await?;
    Ok(json!({ "QueueUrl": queue_url(&app.region, tenant, &cfg.name) }))
}

fn parse_numeric_attr(
    attrs: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<u32>, ApiError> {
    attrs
        .get(key)
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| ApiError::BadRequest(format!("{key} must be a non-negative integer")))
        })
        .transpose()
}

async fn delete_queue(
    app: &AppState,
    tenant: TenantId,
    req: QueueUrlRequest,
) -> Result<serde_json::Value, ApiError> {
    let name = queue_name_from_url(&req.queue_url)?;
    app.engine.delete_queue(tenant, &name).await?;
    Ok(json!({}))
}

async fn purge_queue(
    app: &AppState,
    tenant: TenantId,
    req: QueueUrlRequest,
) -> Result<serde_json::Value, ApiError> {
    let name = queue_name_from_url(&req.queue_url)?;
    app.engine.purge_queue(tenant, &name).await?;
    Ok(json!({ "Success": true }))
}

async fn get_queue_attributes(
    app: &AppState,
    tenant: TenantId,
    req: GetQueueAttributesRequest,
) -> Result<serde_json::Value, ApiError> {
    use burrowmq_core::MessageState;
    let name = queue_name_from_url(&req.queue_url)?;
    let cfg = app.engine.get_queue(tenant, &name).await?;
    let stats = app.engine.stats(tenant, &name).await?;
    let count = |s: MessageState| stats.counts.get(&s).copied().unwrap_or(0);

    let mut all = BTreeMap::new();
    all.insert(
        "ApproximateNumberOfMessages".to_string(),
        count(MessageState::Visible).to_string(),
    );
    all.insert(
        "ApproximateNumberOfMessagesNotVisible".to_string(),
        count(MessageState::Leased).to_string(),
    );
    all.insert(
        "ApproximateNumberOfMessagesDelayed".to_string(),
        count(MessageState::Delayed).to_string(),
    );
    all.insert(
        "VisibilityTimeout".to_string(),
        cfg.visibility_timeout.to_string(),
    );
    all.insert("DelaySeconds".to_string(), cfg.delay_seconds.to_string());
    all.insert(
        "CreatedTimestamp".to_string(),
        cfg.created_at.timestamp().to_string(),
    );

    let attributes: BTreeMap<String, String> = match req.attribute_names {
        Some(names) if !names.iter().any(|n| n == "All") => all
            .into_iter()
            .filter(|(k, _)| names.iter().any(|n| n == k))
            .collect(),
        _ => all,
    };
    Ok(json!({ "Attributes": attributes }))
}

async fn send_message(
    app: &AppState,
    tenant: TenantId,
    req: SendMessageRequest,
) -> Result<serde_json::Value, ApiError> {
    let name = queue_name_from_url(&req.queue_url)?;
    let attrs = decode_attributes(req.message_attributes)?;
    let body = req.message_body.into_bytes();
    let body_digest = md5_hex(&body);
    let attr_digest = if attrs.is_empty() {
        None
    } else {
        Some(md5_of_attributes(&attrs))
    };
    let id = app
        .engine
        .enqueue(tenant, &name, body, attrs, req.delay_seconds, None)
        .await?;
    let mut resp = json!({
        "MessageId": id.to_string(),
        "MD5OfMessageBody": body_digest,
    });
    if let Some(d) = attr_digest {
        resp["MD5OfMessageAttributes"] = json!(d);
    }
    Ok(resp)
}

async fn receive_message(
    app: &AppState,
    tenant: TenantId,
    req: ReceiveMessageRequest,
) -> Result<serde_json::Value, ApiError> {
    let name = queue_name_from_url(&req.queue_url)?;
    let msgs = app
        .engine
        .dequeue(
            tenant,
            &name,
            req.max_number_of_messages,
            req.visibility_timeout,
            req.wait_time_seconds,
        )
        .await?;
    let wire: Vec<WireMessage> = msgs.iter().map(to_wire_message).collect();
    Ok(json!({ "Messages": wire }))
}

async fn delete_message(
    app: &AppState,
    tenant: TenantId,
    req: DeleteMessageRequest,
) -> Result<serde_json::Value, ApiError> {
    let name = queue_name_from_url(&req.queue_url)?;
    let id: u64 = req
        .receipt_handle
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid receipt handle".into()))?;
    app.engine.delete(tenant, &name, id).await?;
    Ok(json!({}))
}
