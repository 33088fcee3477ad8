//! Request and response bodies of the upstream's two endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phase one: create conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CreateChatRequest {
    pub chat: NewChat,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewChat {
    pub id: String,
    pub title: String,
    pub models: Vec<String>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub history: ChatHistory,
    pub messages: Vec<HistoryMessage>,
    pub tags: Vec<String>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub messages: BTreeMap<String, HistoryMessage>,
    pub current_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub role: String,
    pub content: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_idx: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateChatResponse {
    #[serde(default)]
    pub id: String,
}

/// Ids of the two messages seeded into a new conversation.
#[derive(Debug, Clone)]
pub struct SeedIds {
    pub user: String,
    pub assistant: String,
}

impl SeedIds {
    pub fn random() -> Self {
        Self {
            user: uuid::Uuid::new_v4().to_string(),
            assistant: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Build the create-conversation body: a user message holding `content` and
/// an empty assistant placeholder as its only child.
pub fn create_chat_request(
    ids: &SeedIds,
    content: &str,
    model: &str,
    model_name: &str,
    timestamp: i64,
) -> CreateChatRequest {
    let user = HistoryMessage {
        id: ids.user.clone(),
        parent_id: None,
        children_ids: vec![ids.assistant.clone()],
        role: "user".to_string(),
        content: content.to_string(),
        timestamp,
        models: Some(vec![model.to_string()]),
        model: None,
        model_name: None,
        model_idx: None,
    };
    let assistant = HistoryMessage {
        id: ids.assistant.clone(),
        parent_id: Some(ids.user.clone()),
        children_ids: Vec::new(),
        role: "assistant".to_string(),
        content: String::new(),
        timestamp,
        models: None,
        model: Some(model.to_string()),
        model_name: Some(model_name.to_string()),
        model_idx: Some(0),
    };

    let messages = vec![user.clone(), assistant.clone()];
    let mut graph = BTreeMap::new();
    graph.insert(user.id.clone(), user);
    graph.insert(assistant.id.clone(), assistant);

    CreateChatRequest {
        chat: NewChat {
            id: String::new(),
            title: "New Chat".to_string(),
            models: vec![model.to_string()],
            params: serde_json::Map::new(),
            history: ChatHistory {
                messages: graph,
                current_id: ids.assistant.clone(),
            },
            messages,
            tags: Vec::new(),
            timestamp: timestamp * 1000,
        },
        folder_id: None,
    }
}

// ---------------------------------------------------------------------------
// Phase two: streamed completion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StreamCompletionRequest {
    pub stream: bool,
    pub model: String,
    pub chat_id: String,
    pub messages: Vec<StreamMessage>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub tool_servers: Vec<serde_json::Value>,
    pub features: Features,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    pub role: String,
    pub content: String,
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Features {
    pub image_generation: bool,
    pub code_interpreter: bool,
    pub web_search: bool,
}

/// Prompt variables the upstream substitutes into its system prompt.
pub fn prompt_variables(
    now: DateTime<Local>,
    timezone: &str,
    language: &str,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert(
        "{{CURRENT_DATETIME}}".to_string(),
        now.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    vars.insert(
        "{{CURRENT_DATE}}".to_string(),
        now.format("%Y-%m-%d").to_string(),
    );
    vars.insert(
        "{{CURRENT_TIME}}".to_string(),
        now.format("%H:%M:%S").to_string(),
    );
    vars.insert(
        "{{CURRENT_WEEKDAY}}".to_string(),
        now.format("%A").to_string(),
    );
    vars.insert("{{CURRENT_TIMEZONE}}".to_string(), timezone.to_string());
    vars.insert("{{USER_LANGUAGE}}".to_string(), language.to_string());
    vars
}

pub fn stream_completion_request(
    chat_id: &str,
    model: &str,
    content: &str,
    variables: BTreeMap<String, String>,
) -> StreamCompletionRequest {
    StreamCompletionRequest {
        stream: true,
        model: model.to_string(),
        chat_id: chat_id.to_string(),
        messages: vec![StreamMessage {
            role: "user".to_string(),
            content: content.to_string(),
            extensions: serde_json::Map::new(),
        }],
        params: serde_json::Map::new(),
        tool_servers: Vec::new(),
        features: Features::default(),
        variables,
    }
}
