//! Pure helpers that classify requests by API family and pull loggable
//! content out of request / response payloads. Everything here is
//! best-effort: a shape mismatch yields `None`, never an error.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFamily {
    Chat,
    Completion,
    Embedding,
    Image,
    Response,
    Unknown,
}

impl ApiFamily {
    /// Case-insensitive substring match on the request path; first hit wins.
    /// `chat/completions` must be probed before the bare `completions`.
    pub fn from_path(path: &str) -> Self {
        let lowered = path.to_ascii_lowercase();
        if lowered.contains("chat/completions") {
            ApiFamily::Chat
        } else if lowered.contains("completions") {
            ApiFamily::Completion
        } else if lowered.contains("embeddings") {
            ApiFamily::Embedding
        } else if lowered.contains("images") {
            ApiFamily::Image
        } else if lowered.contains("responses") {
            ApiFamily::Response
        } else {
            ApiFamily::Unknown
        }
    }
}

/// Pull the user-facing prompt out of a request body for the given family.
/// Key presence wins over value shape: a present-but-null key is returned
/// as-is rather than falling through to the next candidate.
pub fn extract_prompt(family: ApiFamily, body: Option<&Value>) -> Option<Value> {
    let obj = body?.as_object()?;
    match family {
        ApiFamily::Chat => obj.get("messages").cloned(),
        ApiFamily::Response => obj.get("input").or_else(|| obj.get("messages")).cloned(),
        ApiFamily::Completion => obj.get("prompt").cloned(),
        ApiFamily::Embedding => obj.get("input").cloned(),
        ApiFamily::Image => obj.get("prompt").cloned(),
        ApiFamily::Unknown => ["messages", "input", "prompt"]
            .iter()
            .find_map(|key| obj.get(*key))
            .cloned(),
    }
}

/// Assistant-side fields pulled out of a buffered upstream response.
#[derive(Debug, Clone, Default)]
pub struct ExtractedOutput {
    pub content: Option<Value>,
    pub tool_calls: Option<Value>,
    pub refusal: Option<Value>,
}

fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Extract the assistant output from a non-streaming response body.
/// `None` means nothing was found and no output event should be emitted.
pub fn extract_output(family: ApiFamily, body: Option<&Value>) -> Option<ExtractedOutput> {
    let obj = body?.as_object()?;
    match family {
        ApiFamily::Chat => {
            let message = obj.get("choices")?.get(0)?.get("message")?.as_object()?;
            let content = message.get("content").filter(|v| !v.is_null()).cloned();
            let tool_calls = message.get("tool_calls").filter(|v| present(v)).cloned();
            let refusal = message.get("refusal").filter(|v| present(v)).cloned();
            if content.is_none() && tool_calls.is_none() && refusal.is_none() {
                return None;
            }
            Some(ExtractedOutput {
                content,
                tool_calls,
                refusal,
            })
        }
        ApiFamily::Completion => {
            let text = obj.get("choices")?.get(0)?.get("text")?.clone();
            Some(ExtractedOutput {
                content: Some(text),
                ..Default::default()
            })
        }
        ApiFamily::Embedding => {
            let dims = obj
                .get("data")?
                .get(0)?
                .get("embedding")?
                .as_array()?
                .len();
            Some(ExtractedOutput {
                content: Some(Value::String(format!("embedding with {dims} dimensions"))),
                ..Default::default()
            })
        }
        ApiFamily::Image => {
            let first = obj.get("data")?.get(0)?.as_object()?;
            let mut out = Map::new();
            out.insert(
                "url".to_string(),
                first.get("url").cloned().unwrap_or(Value::Null),
            );
            out.insert(
                "revised_prompt".to_string(),
                first.get("revised_prompt").cloned().unwrap_or(Value::Null),
            );
            Some(ExtractedOutput {
                content: Some(Value::Object(out)),
                ..Default::default()
            })
        }
        ApiFamily::Response | ApiFamily::Unknown => {
            let content = ["content", "text", "output", "result"]
                .iter()
                .find_map(|key| obj.get(*key))?
                .clone();
            Some(ExtractedOutput {
                content: Some(content),
                ..Default::default()
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCallFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

/// A tool call folded together from streaming deltas sharing one `index`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    pub function: ToolCallFunction,
}

impl ToolCall {
    fn new(index: u64) -> Self {
        Self {
            index,
            id: None,
            call_type: None,
            function: ToolCallFunction::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedChat {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Fold an accumulated SSE chat stream back into one logical response.
/// Content deltas concatenate in arrival order; tool-call deltas merge per
/// `index`, with `function.arguments` concatenated and `id` taken from the
/// last non-empty delta. Unparseable lines are skipped silently.
pub fn reconstruct_chat_stream(raw: &[u8]) -> Option<StreamedChat> {
    let text = String::from_utf8_lossy(raw);
    let mut content = String::new();
    let mut calls: BTreeMap<u64, ToolCall> = BTreeMap::new();

    for line in text.split('\n') {
        let Some(data) = line.trim().strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let Some(delta) = value.get("choices").and_then(|c| c.get(0)?.get("delta")) else {
            continue;
        };
        if let Some(piece) = delta.get("content").and_then(|c| c.as_str())
            && !piece.is_empty()
        {
            content.push_str(piece);
        }
        let Some(deltas) = delta.get("tool_calls").and_then(|t| t.as_array()) else {
            continue;
        };
        for item in deltas {
            let Some(index) = item.get("index").and_then(|i| i.as_u64()) else {
                continue;
            };
            let entry = calls.entry(index).or_insert_with(|| ToolCall::new(index));
            if let Some(id) = item.get("id").and_then(|v| v.as_str())
                && !id.is_empty()
            {
                entry.id = Some(id.to_string());
            }
            if let Some(call_type) = item.get("type").and_then(|v| v.as_str()) {
                entry.call_type = Some(call_type.to_string());
            }
            if let Some(function) = item.get("function") {
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    entry.function.name = Some(name.to_string());
                }
                if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                    entry.function.arguments.push_str(arguments);
                }
            }
        }
    }

    let tool_calls: Vec<ToolCall> = calls.into_values().collect();
    if content.is_empty() && tool_calls.is_empty() {
        return None;
    }
    Some(StreamedChat {
        content: (!content.is_empty()).then_some(content),
        tool_calls,
    })
}

/// Bound `content` by its JSON-encoded size: values whose encoding exceeds
/// `max_bytes` are replaced with the lossy-decoded prefix of that encoding
/// and flagged as truncated. Null stays null and is never flagged.
pub fn bound_content(content: Value, max_bytes: usize) -> (Value, bool) {
    if content.is_null() {
        return (content, false);
    }
    let encoded =
        serde_json::to_vec(&content).unwrap_or_else(|_| content.to_string().into_bytes());
    if encoded.len() <= max_bytes {
        return (content, false);
    }
    let prefix = String::from_utf8_lossy(&encoded[..max_bytes]).into_owned();
    (Value::String(prefix), true)
}
