use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode, header};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::warn;

use crate::interpret::{self, ApiFamily};
use crate::logging::{JsonlLogger, LogEvent, OutputRecord};

use super::{ProxyService, apply_upstream_headers};

#[derive(Default)]
struct StreamCapture {
    buffer: Vec<u8>,
    finished: bool,
}

/// Emits the assistant output event exactly once when the forwarded stream
/// ends, errors out, or the client disconnects. Held by the chunk-mapping
/// closure so dropping the response body triggers the tail emission.
struct StreamFinalize {
    family: ApiFamily,
    max_prompt_bytes: usize,
    logger: Arc<JsonlLogger>,
    capture: Arc<Mutex<StreamCapture>>,
}

impl Drop for StreamFinalize {
    fn drop(&mut self) {
        let mut guard = match self.capture.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.finished {
            return;
        }
        guard.finished = true;
        let raw = std::mem::take(&mut guard.buffer);
        drop(guard);

        let (record, truncated) =
            assistant_record_from_stream(self.family, &raw, self.max_prompt_bytes);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            // Best effort: the client already has its response.
            if let Err(err) = logger.write_event(LogEvent::output(record, truncated)).await {
                warn!("failed to write streamed output event: {err:#}");
            }
        });
    }
}

/// Build the logical assistant record from the accumulated stream bytes.
/// Chat streams are folded back into content + tool calls; everything else
/// (and chat streams that yielded nothing) logs the raw decoded text.
fn assistant_record_from_stream(
    family: ApiFamily,
    raw: &[u8],
    max_prompt_bytes: usize,
) -> (OutputRecord, bool) {
    let mut content: Option<Value> = None;
    let mut tool_calls: Option<Value> = None;

    if family == ApiFamily::Chat
        && let Some(reconstructed) = interpret::reconstruct_chat_stream(raw)
    {
        content = reconstructed.content.map(Value::String);
        if !reconstructed.tool_calls.is_empty() {
            tool_calls = serde_json::to_value(&reconstructed.tool_calls).ok();
        }
    }
    if content.is_none() && tool_calls.is_none() {
        content = Some(Value::String(String::from_utf8_lossy(raw).into_owned()));
    }

    let (content, truncated) =
        interpret::bound_content(content.unwrap_or(Value::Null), max_prompt_bytes);
    let record = OutputRecord {
        tool_calls,
        ..OutputRecord::new(family, content)
    };
    (record, truncated)
}

/// Forward the upstream response chunk-by-chunk while teeing every chunk
/// into an in-memory accumulator for the final log event.
pub(super) fn build_streaming_response(
    proxy: &ProxyService,
    family: ApiFamily,
    status: StatusCode,
    upstream_headers: HeaderMap,
    resp: reqwest::Response,
) -> Response<Body> {
    let capture = Arc::new(Mutex::new(StreamCapture::default()));
    let finalize = StreamFinalize {
        family,
        max_prompt_bytes: proxy.config.logging.max_prompt_bytes as usize,
        logger: proxy.logger.clone(),
        capture: capture.clone(),
    };

    let stream = resp.bytes_stream().map(move |item| {
        let _finalize = &finalize;
        match item {
            Ok(chunk) => {
                if let Ok(mut guard) = capture.lock() {
                    guard.buffer.extend_from_slice(&chunk);
                }
                Ok(chunk)
            }
            Err(err) => {
                warn!("upstream stream error: {err}");
                Err(err)
            }
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = upstream_headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    let mut response = builder.body(Body::from_stream(stream)).unwrap();
    apply_upstream_headers(response.headers_mut(), &upstream_headers);
    response
}
