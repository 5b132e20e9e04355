//! Content-addressed keys for model requests.
//!
//! A key is the SHA-256 of a canonical JSON projection of the request:
//! whitespace-trimmed prompt, message and tool text; tools sorted by name;
//! message order preserved; `max_tokens` left out. Struct fields serialize
//! in declaration order and `serde_json::Value` objects keep sorted keys,
//! so the encoding is stable across runs.

use super::request::CompletionRequest;
use crate::util::hash_bytes;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct CacheKeyMessage<'a> {
    role: &'a str,
    content: &'a str,
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CacheKeyTool<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CacheKeyRequest<'a> {
    model: &'a str,
    system_prompt: &'a str,
    messages: Vec<CacheKeyMessage<'a>>,
    tools: Vec<CacheKeyTool<'a>>,
    temperature: f32,
}

impl<'a> CacheKeyRequest<'a> {
    fn project(request: &'a CompletionRequest) -> Self {
        let messages = request
            .messages
            .iter()
            .map(|m| CacheKeyMessage {
                role: m.role.trim(),
                content: m.content.trim(),
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();

        let mut tools: Vec<CacheKeyTool<'a>> = request
            .tools
            .iter()
            .map(|t| CacheKeyTool {
                name: t.name.trim(),
                description: t.description.trim(),
                parameters: &t.parameters,
            })
            .collect();
        tools.sort_by(|a, b| {
            a.name
                .cmp(b.name)
                .then_with(|| a.description.cmp(b.description))
        });

        Self {
            model: request.model.trim(),
            system_prompt: request.system_prompt.trim(),
            messages,
            tools,
            // -0.0 and 0.0 mean the same thing.
            temperature: if request.temperature == 0.0 {
                0.0
            } else {
                request.temperature
            },
        }
    }
}

/// Canonical JSON encoding of the key projection.
pub fn canonicalize(request: &CompletionRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(&CacheKeyRequest::project(request))
}

/// 64-character lowercase hex key for `request`.
pub fn generate_key(request: &CompletionRequest) -> Result<String, serde_json::Error> {
    Ok(hash_bytes(canonicalize(request)?.as_bytes()))
}

/// Whether `key` has the shape produced by [`generate_key`].
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
