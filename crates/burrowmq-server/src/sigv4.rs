//! AWS Signature Version 4, header scheme only. Query-string signing and
//! the legacy V2 scheme are rejected.

use crate::tenant::TenantDirectory;
use axum::http::{HeaderMap, Uri};
use burrowmq_core::TenantId;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingAuthHeader,
    #[error("malformed Authorization header")]
    MalformedAuthHeader,
    #[error("only Signature Version 4 is supported")]
    UnsupportedSignatureVersion,
    #[error("unknown access key id")]
    UnknownAccessKey,
    #[error("signature does not match")]
    SignatureDoesNotMatch,
}

#[derive(Debug)]
struct ParsedAuth {
    access_key_id: String,
    date: String,
    region: String,
    service: String,
    signed_headers: Vec<String>,
    signature: String,
}

/// Checks the request signature and returns the authenticated tenant.
pub fn verify(
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    dir: &TenantDirectory,
) -> Result<TenantId, AuthError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedAuthHeader)?;
    if header.starts_with("AWS ") {
        return Err(AuthError::UnsupportedSignatureVersion);
    }
    let auth = parse_authorization(header)?;

    let cred = dir
        .resolve(&auth.access_key_id, &auth.region)
        .ok_or(AuthError::UnknownAccessKey)?;

    let amz_date = headers
        .get("x-amz-date")
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MalformedAuthHeader)?;

    let payload_hash = hex::encode(Sha256::digest(body));
    let canonical = canonical_request(
        method,
        uri.path(),
        uri.query().unwrap_or(""),
        headers,
        &auth.signed_headers,
        &payload_hash,
    )?;
    let scope = format!(
        "{}/{}/{}/aws4_request",
        auth.date, auth.region, auth.service
    );
    let sts = string_to_sign(amz_date, &scope, &canonical);
    let key = signing_key(&cred.secret, &auth.date, &auth.region, &auth.service);

    let presented = hex::decode(&auth.signature).map_err(|_| AuthError::MalformedAuthHeader)?;
    let mut mac = HmacSha256::new_from_slice(&key).unwrap();
    mac.update(sts.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| AuthError::SignatureDoesNotMatch)?;
    Ok(cred.tenant_id)
}

/// Produces the `Authorization` and `X-Amz-Date` headers for a request.
/// Signs `host`, `x-amz-date` and, when present, `x-amz-target`.
pub fn sign(
    method: &str,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    access_key_id: &str,
    secret: &str,
    region: &str,
) {
    if !headers.contains_key("x-amz-date") {
        let now = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        if let Ok(v) = now.parse() {
            headers.insert("x-amz-date", v);
        }
    }
    let amz_date = headers
        .get("x-amz-date")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let date = amz_date.chars().take(8).collect::<String>();

    let mut signed: Vec<String> = ["host", "x-amz-date", "x-amz-target"]
        .iter()
        .filter(|h| headers.contains_key(**h))
        .map(|h| h.to_string())
        .collect();
    signed.sort();

    let payload_hash = hex::encode(Sha256::digest(body));
    let canonical = canonical_request(
        method,
        uri.path(),
        uri.query().unwrap_or(""),
        headers,
        &signed,
        &payload_hash,
    )
    .unwrap_or_default();
    let scope = format!("{date}/{region}/sqs/aws4_request");
    let sts = string_to_sign(&amz_date, &scope, &canonical);
    let key = signing_key(secret, &date, region, "sqs");
    let signature = hex::encode(hmac(&key, sts.as_bytes()));

    let header = format!(
        "{ALGORITHM} Credential={access_key_id}/{scope}, SignedHeaders={}, Signature={signature}",
        signed.join(";")
    );
    if let Ok(v) = header.parse() {
        headers.insert(axum::http::header::AUTHORIZATION, v);
    }
}

fn parse_authorization(header: &str) -> Result<ParsedAuth, AuthError> {
    let rest = header
        .strip_prefix(ALGORITHM)
        .ok_or(AuthError::UnsupportedSignatureVersion)?
        .trim();
    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in rest.split(',') {
        let part = part.trim();
        match part.split_once('=') {
            Some(("Credential", v)) => credential = Some(v),
            Some(("SignedHeaders", v)) => signed_headers = Some(v),
            Some(("Signature", v)) => signature = Some(v),
            _ => {}
        }
    }
    let credential = credential.ok_or(AuthError::MalformedAuthHeader)?;
    let parts: Vec<&str> = credential.split('/').collect();
    let [access_key_id, date, region, service, terminator] = parts.as_slice() else {
        return Err(AuthError::MalformedAuthHeader);
    };
    if *terminator != "aws4_request" {
        return Err(AuthError::MalformedAuthHeader);
    }
    let signed_headers: Vec<String> = signed_headers
        .ok_or(AuthError::MalformedAuthHeader)?
        .split(';')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    let signature = signature.ok_or(AuthError::MalformedAuthHeader)?;
    if signed_headers.is_empty() || signature.is_empty() {
        return Err(AuthError::MalformedAuthHeader);
    }
    Ok(ParsedAuth {
        access_key_id: access_key_id.to_string(),
        date: date.to_string(),
        region: region.to_string(),
        service: service.to_string(),
        signed_headers,
        signature: signature.to_string(),
    })
}

fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    signed_headers: &[String],
    payload_hash: &str,
) -> Result<String, AuthError> {
    let mut canonical_headers = String::new();
    for name in signed_headers {
        let values: Vec<&str> = headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            return Err(AuthError::MalformedAuthHeader);
        }
        let joined = values
            .iter()
            .map(|v| collapse_spaces(v))
            .collect::<Vec<_>>()
            .join(",");
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(&joined);
        canonical_headers.push('\n');
    }
    let path = if path.is_empty() { "/" } else { path };
    Ok(format!(
        "{method}\n{path}\n{}\n{canonical_headers}\n{}\n{payload_hash}",
        canonical_query(query),
        signed_headers.join(";")
    ))
}

fn collapse_spaces(v: &str) -> String {
    v.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k = hmac(&k, region.as_bytes());
    let k = hmac(&k, service.as_bytes());
    hmac(&k, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> TenantDirectory {
        let dir = TenantDirectory::new(1);
        dir.insert("AKIDEXAMPLE", 1, "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY");
        dir
    }

    fn signed_request(body: &[u8]) -> (Uri, HeaderMap) {
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "sqs.localhost".parse().unwrap());
        headers.insert("x-amz-target", "AmazonSQS.ListQueues".parse().unwrap());
        sign(
            "POST",
            &uri,
            &mut headers,
            body,
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "us-east-1",
        );
        (uri, headers)
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let dir = directory();
        let (uri, headers) = signed_request(b"{}");
        let tenant = verify("POST", &uri, &headers, b"{}", &dir).unwrap();
        assert_eq!(tenant, 1);
    }

    #[test]
    fn tampered_body_is_rejected() {
        let dir = directory();
        let (uri, headers) = signed_request(b"{}");
        let err = verify("POST", &uri, &headers, b"{\"evil\":1}", &dir).unwrap_err();
        assert_eq!(err, AuthError::SignatureDoesNotMatch);
    }

    #[test]
    fn missing_header() {
        let dir = directory();
        let uri: Uri = "/".parse().unwrap();
        let headers = HeaderMap::new();
        assert_eq!(
            verify("POST", &uri, &headers, b"", &dir).unwrap_err(),
            AuthError::MissingAuthHeader
        );
    }

    #[test]
    fn v2_scheme_is_unsupported() {
        let dir = directory();
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "AWS AKIDEXAMPLE:frJIUN8DYpKDtOLCwo//yllqDzg=".parse().unwrap(),
        );
        assert_eq!(
            verify("POST", &uri, &headers, b"", &dir).unwrap_err(),
            AuthError::UnsupportedSignatureVersion
        );
    }

    #[test]
    fn unknown_access_key() {
        let dir = directory();
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "sqs.localhost".parse().unwrap());
        sign("POST", &uri, &mut headers, b"{}", "WHO", "secret", "us-east-1");
        assert_eq!(
            verify("POST", &uri, &headers, b"{}", &dir).unwrap_err(),
            AuthError::UnknownAccessKey
        );
    }

    #[test]
    fn garbage_header_is_malformed() {
        let dir = directory();
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "AWS4-HMAC-SHA256 Credential=oops".parse().unwrap(),
        );
        assert_eq!(
            verify("POST", &uri, &headers, b"", &dir).unwrap_err(),
            AuthError::MalformedAuthHeader
        );
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let dir = directory();
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "sqs.localhost".parse().unwrap());
        sign("POST", &uri, &mut headers, b"{}", "AKIDEXAMPLE", "not-the-secret", "us-east-1");
        assert_eq!(
            verify("POST", &uri, &headers, b"{}", &dir).unwrap_err(),
            AuthError::SignatureDoesNotMatch
        );
    }

    #[test]
    fn header_values_are_collapsed() {
        assert_eq!(collapse_spaces("  a   b  c "), "a b c");
    }

    #[test]
    fn query_is_sorted() {
        assert_eq!(canonical_query("b=2&a=1&a=0"), "a=0&a=1&b=2");
        assert_eq!(canonical_query(""), "");
    }
}
