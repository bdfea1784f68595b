//! HTTP driver
//!
//! One shared client per executor; connection pooling is the client's
//! concern. A transport or body-read failure is an operation error; any
//! completed response is a success carrying the status as data.

use blueprint_core::{MapKey, NodeKind, Value};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{want_pairs, want_string, DriverContext};
use crate::outcome::OpError;

pub async fn run(kind: NodeKind, ctx: &DriverContext) -> Result<Value, OpError> {
    let NodeKind::HttpRequest {
        method,
        url,
        headers,
        body,
    } = kind
    else {
        return Err(OpError::operation("not an http kind"));
    };

    let method = want_string("http_request", "method", &method)?;
    let url = want_string("http_request", "url", &url)?;
    let method: reqwest::Method = method
        .to_uppercase()
        .parse()
        .map_err(|_| OpError::operation(format!("invalid HTTP method: {}", method)))?;

    let mut header_map = HeaderMap::new();
    for (name, value) in want_pairs("http_request", "headers", &headers)? {
        let value = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            header_map.insert(name, value);
        }
    }

    let request = ctx.http.request(method, url.clone()).headers(header_map);
    let request = match &body {
        Value::Null => request,
        Value::String(s) => request.body(s.clone()),
        Value::Bytes(b) => request.body(b.clone()),
        other => {
            let json = other.to_json().ok_or_else(|| {
                OpError::operation("http_request: body is not representable as JSON")
            })?;
            request.json(&json)
        }
    };

    let response = request
        .send()
        .await
        .map_err(|e| OpError::operation(format!("http request to {} failed: {}", url, e)))?;

    let status = response.status().as_u16();
    let response_headers: std::collections::BTreeMap<MapKey, Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (MapKey::Str(name.to_string()), Value::String(v.to_string())))
        })
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| OpError::operation(format!("http response read failed: {}", e)))?;

    Ok(Value::record([
        ("status", Value::Int(status as i64)),
        ("headers", Value::Map(response_headers)),
        ("body", Value::String(body)),
    ]))
}
