//! Non-streaming responses: drain the delta stream, then build one JSON body.

use futures::StreamExt;

use super::anthropic_stream::{map_finish_reason, new_message_id, output_tokens};
use super::anthropic_types::{MessagesResponse, ResponseContentBlock, Usage};
use super::openai_stream::new_completion_id;
use super::openai_types::{ChatCompletionResponse, ChatUsage, Choice, ChoiceMessage};
use super::estimate_tokens;
use crate::upstream::{Delta, DeltaStream, FINISH_STOP};

/// Everything a delta stream produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    pub text: String,
    pub finish_reason: String,
}

impl Collected {
    pub fn output_chars(&self) -> usize {
        self.text.chars().count()
    }
}

/// Concatenate text up to the first finish marker.
pub async fn collect(mut deltas: DeltaStream) -> Collected {
    let mut text = String::new();
    while let Some(delta) = deltas.next().await {
        match delta {
            Delta::Text(fragment) => text.push_str(&fragment),
            Delta::Finish(finish_reason) => return Collected { text, finish_reason },
        }
    }
    Collected {
        text,
        finish_reason: FINISH_STOP.to_string(),
    }
}

pub fn anthropic_message(
    collected: &Collected,
    model: &str,
    input_tokens: u64,
) -> MessagesResponse {
    MessagesResponse {
        id: new_message_id(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: vec![ResponseContentBlock::Text {
            text: collected.text.clone(),
        }],
        model: model.to_string(),
        stop_reason: Some(map_finish_reason(&collected.finish_reason)),
        stop_sequence: None,
        usage: Usage {
            input_tokens,
            output_tokens: output_tokens(collected.output_chars()),
        },
    }
}

pub fn openai_completion(
    collected: &Collected,
    model: &str,
    input_tokens: u64,
) -> ChatCompletionResponse {
    let completion_tokens = estimate_tokens(collected.output_chars());
    ChatCompletionResponse {
        id: new_completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: collected.text.clone(),
            },
            finish_reason: Some(collected.finish_reason.clone()),
        }],
        usage: ChatUsage {
            prompt_tokens: input_tokens,
            completion_tokens,
            total_tokens: input_tokens + completion_tokens,
        },
    }
}
