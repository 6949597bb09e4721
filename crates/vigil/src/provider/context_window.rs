//! Context-window registry with per-family defaults.
//!
//! Providers advertise the model's context window from here; an explicit
//! override in configuration always supersedes the registry.

/// Fallback for models the registry does not know.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// Known model-family context windows, longest prefix first.
const REGISTRY: &[(&str, u64)] = &[
    ("gemini-2.5", 1_048_576),
    ("gemini-2.0", 1_048_576),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5", 1_048_576),
    ("claude-3-5", 200_000),
    ("claude-3", 200_000),
    ("claude-", 200_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("o3", 200_000),
    ("o4-mini", 200_000),
];

/// Look up the context window for a model identifier by family prefix.
pub fn context_window_for(model: &str) -> u64 {
    let lowered = model.to_ascii_lowercase();
    REGISTRY
        .iter()
        .find(|(prefix, _)| lowered.starts_with(prefix))
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}
