use crate::llm::{ChatTurn, CompletionRequest};
use crate::state::MessageRole;

pub const TITLE_INSTRUCTION: &str = "You are a title generator. Generate a short, concise, and descriptive title (3-5 words maximum) for the following conversation. Do not use quotes or punctuation. Just return the title text only.";

pub const DEFAULT_TITLE: &str = "New Chat";

const MAX_TITLE_CHARS: usize = 50;
const TRUNCATED_TITLE_CHARS: usize = 47;
const FALLBACK_WORDS: usize = 5;

pub fn title_request(model: &str, first_message: &str) -> CompletionRequest {
    let history = [ChatTurn::new(MessageRole::System, TITLE_INSTRUCTION)];
    let prompt = format!("Generate a title for this message: \"{first_message}\"");
    let mut request = CompletionRequest::chat(model, &history, &prompt);
    request.max_tokens = Some(30);
    request.temperature = Some(0.7);
    request
}

/// Tidy a model-produced title. Returns `None` when nothing is left.
pub fn clean_title(raw: &str) -> Option<String> {
    let is_quote = |c: char| c == '"' || c == '\'';
    let trimmed = raw.trim();
    let unquoted = trimmed.strip_prefix(is_quote).unwrap_or(trimmed);
    let unquoted = unquoted.strip_suffix(is_quote).unwrap_or(unquoted);
    let cleaned = unquoted
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
        .trim();
    if cleaned.is_empty() {
        return None;
    }
    Some(cap_length(cleaned))
}

/// First five words of the message, capped like a generated title.
pub fn fallback_title(message: &str) -> String {
    let words: Vec<&str> = message.split_whitespace().take(FALLBACK_WORDS).collect();
    cap_length(&words.join(" "))
}

fn cap_length(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let mut capped: String = title.chars().take(TRUNCATED_TITLE_CHARS).collect();
    capped.push_str("...");
    capped
}
