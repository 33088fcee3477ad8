//! Models the upstream serves, and how Anthropic-dialect model names map onto them.

use serde::Serialize;
use std::collections::HashMap;
use std::hash::BuildHasher;

/// A model the upstream exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamModel {
    pub id: &'static str,
    pub display_name: &'static str,
}

const CATALOG: &[UpstreamModel] = &[
    UpstreamModel {
        id: "gemini-3-pro-image-preview",
        display_name: "Nano Banana Pro",
    },
    UpstreamModel {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
    },
    UpstreamModel {
        id: "claude-opus-4-20250514",
        display_name: "Claude Opus 4",
    },
    UpstreamModel {
        id: "claude-sonnet-4-5-20250929",
        display_name: "Claude Sonnet 4.5",
    },
    UpstreamModel {
        id: "claude-sonnet-4-20250514",
        display_name: "Claude Sonnet 4",
    },
    UpstreamModel {
        id: "claude-haiku-4-5-20251001",
        display_name: "Claude Haiku 4.5",
    },
    UpstreamModel {
        id: "o1-2024-12-17",
        display_name: "o1",
    },
    UpstreamModel {
        id: "o3-pro-2025-06-10",
        display_name: "o3-pro",
    },
    UpstreamModel {
        id: "grok-4-1-fast-reasoning",
        display_name: "Grok 4.1 Fast",
    },
    UpstreamModel {
        id: "grok-4-0709",
        display_name: "Grok 4",
    },
    UpstreamModel {
        id: "o4-mini-2025-04-16",
        display_name: "o4-mini",
    },
    UpstreamModel {
        id: "gpt-5-2025-08-07",
        display_name: "GPT-5",
    },
    UpstreamModel {
        id: "gemini-2.5-flash-image",
        display_name: "Nano Banana",
    },
];

/// Older or shorthand Claude names and the upstream model that serves them.
const CLAUDE_ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4-5-20250929"),
    ("claude-3-5-sonnet-latest", "claude-sonnet-4-5-20250929"),
    ("claude-3-5-haiku-20241022", "claude-haiku-4-5-20251001"),
    ("claude-3-5-haiku-latest", "claude-haiku-4-5-20251001"),
    ("claude-3-opus-20240229", "claude-opus-4-20250514"),
    ("claude-3-opus-latest", "claude-opus-4-20250514"),
    ("claude-3-sonnet-20240229", "claude-sonnet-4-20250514"),
    ("claude-3-haiku-20240307", "claude-haiku-4-5-20251001"),
    ("opus", "claude-opus-4-20250514"),
    ("sonnet", "claude-sonnet-4-5-20250929"),
    ("haiku", "claude-haiku-4-5-20251001"),
];

/// Default model for Anthropic-dialect requests that omit one.
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5-20250929";

#[must_use]
pub fn catalog() -> &'static [UpstreamModel] {
    CATALOG
}

/// Display name the upstream expects alongside a model id; unknown ids are
/// their own display name.
#[must_use]
pub fn display_name(model: &str) -> &str {
    CATALOG
        .iter()
        .find(|m| m.id == model)
        .map_or(model, |m| m.display_name)
}

/// Resolve an Anthropic-dialect model name to an upstream model id.
/// Configured overrides win over the built-in aliases; anything unmapped passes through.
pub fn resolve_claude_model<S: BuildHasher>(
    requested: &str,
    overrides: &HashMap<String, String, S>,
) -> String {
    if let Some(target) = overrides.get(requested) {
        return target.clone();
    }
    CLAUDE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == requested)
        .map_or_else(|| requested.to_string(), |(_, target)| (*target).to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: &'static str,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// The `/v1/models` listing.
#[must_use]
pub fn model_list() -> ModelList {
    ModelList {
        object: "list",
        data: CATALOG
            .iter()
            .map(|m| ModelEntry {
                id: m.id,
                object: "model",
                owned_by: "zai",
                name: m.display_name,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_lookup() {
        assert_eq!(display_name("gpt-5-2025-08-07"), "GPT-5");
        assert_eq!(display_name("some-new-model"), "some-new-model");
    }

    #[test]
    fn test_claude_aliases() {
        let none: HashMap<String, String> = HashMap::new();
        assert_eq!(
            resolve_claude_model("claude-3-5-sonnet-latest", &none),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(resolve_claude_model("opus", &none), "claude-opus-4-20250514");
        assert_eq!(
            resolve_claude_model("claude-sonnet-4-20250514", &none),
            "claude-sonnet-4-20250514"
        );
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("sonnet".to_string(), "gpt-5-2025-08-07".to_string());
        assert_eq!(resolve_claude_model("sonnet", &overrides), "gpt-5-2025-08-07");
    }

    #[test]
    fn test_model_list_covers_catalog() {
        let list = model_list();
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), catalog().len());
        assert!(list.data.iter().all(|m| m.owned_by == "zai"));
    }
}
