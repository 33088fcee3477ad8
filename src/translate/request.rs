//! Normalize inbound requests from either dialect into one [`ChatRequest`].
//!
//! Only text survives normalization: content parts and blocks are flattened
//! to strings, everything else a caller sends (tools, sampling parameters,
//! images) is dropped. An Anthropic `system` prompt becomes a leading
//! `system` message so it counts toward the input-token estimate.

use std::collections::HashMap;
use std::hash::BuildHasher;

use super::anthropic_types::MessagesRequest;
use super::estimate_tokens;
use super::openai_types::ChatCompletionRequest;
use crate::error::{GatewayError, Result};
use crate::models::{resolve_claude_model, DEFAULT_CLAUDE_MODEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// Upstream model id the request is sent to.
    pub model: String,
    /// Model name as the caller asked for it; echoed back in responses.
    pub requested_model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Content of the last message: the only text the upstream receives.
    pub fn latest_content(&self) -> &str {
        self.messages.last().map_or("", |m| m.content.as_str())
    }

    pub fn input_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    pub fn input_tokens(&self) -> u64 {
        estimate_tokens(self.input_chars())
    }
}

/// Normalize an OpenAI-style request. `model` falls back to `default_model`
/// and is otherwise passed through untouched.
pub fn from_openai(req: ChatCompletionRequest, default_model: &str) -> Result<ChatRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    }

    let model = req
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_model.to_string());

    let messages = req
        .messages
        .into_iter()
        .map(|m| {
            let content = m.content.map(|c| c.as_text()).unwrap_or_default();
            ChatMessage::new(m.role, content)
        })
        .collect();

    Ok(ChatRequest {
        requested_model: model.clone(),
        model,
        messages,
        stream: req.stream.unwrap_or(false),
    })
}

/// Normalize an Anthropic-style request, mapping its model name through
/// `overrides` and the built-in Claude aliases.
pub fn from_anthropic<S: BuildHasher>(
    req: MessagesRequest,
    overrides: &HashMap<String, String, S>,
) -> Result<ChatRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    }

    let requested_model = req
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string());
    let model = resolve_claude_model(&requested_model, overrides);

    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = req.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(ChatMessage::new("system", text));
        }
    }
    messages.extend(
        req.messages
            .iter()
            .map(|m| ChatMessage::new(m.role.as_str(), m.content.as_text())),
    );

    Ok(ChatRequest {
        model,
        requested_model,
        messages,
        stream: req.stream.unwrap_or(false),
    })
}
