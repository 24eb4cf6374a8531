use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, Response, StatusCode, Uri, header};
use axum::routing::any;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument, warn};

mod stream;

use crate::config::AppConfig;
use crate::interpret::{self, ApiFamily};
use crate::logging::{InputRecord, JsonlLogger, LogEvent, OutputRecord};

use self::stream::build_streaming_response;

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers forwarded upstream: everything except `host` and
/// `content-length`, duplicates and non-UTF-8 values preserved as-is.
fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if name_lower == "host" || name_lower == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Copy upstream response headers onto the client response. Hop-by-hop
/// headers are dropped; `content-length` and `content-encoding` are not
/// forwarded because reqwest may have transparently decompressed the body,
/// and `content-type` is mirrored separately by the caller. `set-cookie`
/// keeps duplicates, everything else overwrites.
fn apply_upstream_headers(dst: &mut HeaderMap, upstream: &HeaderMap) {
    for (name, value) in upstream.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
            || name_lower == "content-type"
        {
            continue;
        }
        if name_lower == "set-cookie" {
            dst.append(name.clone(), value.clone());
        } else {
            dst.insert(name.clone(), value.clone());
        }
    }
}

/// `502` body for upstream transport failures, shaped like an OpenAI error.
fn upstream_error_response(err: &reqwest::Error) -> Response<Body> {
    let class = if err.is_timeout() {
        "TimeoutError"
    } else if err.is_connect() {
        "ConnectError"
    } else {
        "RequestError"
    };
    let body = serde_json::json!({
        "error": { "message": "Upstream request failed", "type": class }
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Shared per-process proxy state: one upstream HTTP client, the immutable
/// config, and the JSONL event writer.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub config: Arc<AppConfig>,
    pub logger: Arc<JsonlLogger>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<AppConfig>, logger: Arc<JsonlLogger>) -> Self {
        Self {
            client,
            config,
            logger,
        }
    }

    /// `base_url + path + query`, duplicates in the query string preserved.
    fn build_target(&self, uri: &Uri) -> String {
        let base = &self.config.upstream.base_url;
        match uri.path_and_query() {
            Some(path_and_query) => format!("{base}{path_and_query}"),
            None => base.clone(),
        }
    }

    async fn emit_event(&self, event: LogEvent) {
        // Log failures must never disturb the proxied request.
        if let Err(err) = self.logger.write_event(event).await {
            warn!("failed to write log event: {err:#}");
        }
    }
}

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn handle_proxy(
    proxy: ProxyService,
    req: Request<Body>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let (parts, body) = req.into_parts();
    let uri = parts.uri;
    let method = parts.method;
    let client_headers = parts.headers;

    let raw_body = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let req_json: Option<Value> = serde_json::from_slice(&raw_body).ok();
    let streaming = req_json
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    let family = ApiFamily::from_path(uri.path());
    let max_prompt_bytes = proxy.config.logging.max_prompt_bytes as usize;

    // The input event goes out before upstream dispatch so it is still
    // observable when the upstream is down.
    if let Some(body_json) = req_json.as_ref().filter(|v| v.is_object()) {
        let prompt = interpret::extract_prompt(family, Some(body_json)).unwrap_or(Value::Null);
        let (content, truncated) = interpret::bound_content(prompt, max_prompt_bytes);
        proxy
            .emit_event(LogEvent::input(InputRecord::new(family, content), truncated))
            .await;
    }

    let target = proxy.build_target(&uri);
    debug!("forwarding {} {} to {}", method, uri.path(), target);

    let mut builder = proxy
        .client
        .request(method, target)
        .headers(filter_request_headers(&client_headers));
    if !raw_body.is_empty() {
        builder = builder.body(raw_body);
    }

    let upstream_resp = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => return Ok(upstream_error_response(&err)),
    };

    let status = upstream_resp.status();
    let upstream_headers = upstream_resp.headers().clone();

    if streaming {
        return Ok(build_streaming_response(
            &proxy,
            family,
            status,
            upstream_headers,
            upstream_resp,
        ));
    }

    let bytes = match upstream_resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return Ok(upstream_error_response(&err)),
    };

    let resp_json: Option<Value> = serde_json::from_slice(&bytes).ok();
    if let Some(extracted) = interpret::extract_output(family, resp_json.as_ref()) {
        let (content, truncated) = interpret::bound_content(
            extracted.content.unwrap_or(Value::Null),
            max_prompt_bytes,
        );
        let record = OutputRecord {
            tool_calls: extracted.tool_calls,
            refusal: extracted.refusal,
            ..OutputRecord::new(family, content)
        };
        proxy.emit_event(LogEvent::output(record, truncated)).await;
    }

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = upstream_headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    let mut response = builder.body(Body::from(bytes)).unwrap();
    apply_upstream_headers(response.headers_mut(), &upstream_headers);
    Ok(response)
}

pub fn router(proxy: ProxyService) -> Router {
    // In axum 0.8, wildcard segments use `/{*path}`; the bare root needs its
    // own route.
    let root = proxy.clone();
    Router::new()
        .route("/", any(move |req| handle_proxy(root.clone(), req)))
        .route("/{*path}", any(move |req| handle_proxy(proxy.clone(), req)))
}
