/*!
Thinking-budget rewrite for JSON request bodies.

A model name such as `claude-sonnet-4-5-thinking-5000` is split at the last
`-thinking-` into the clean model name and a budget suffix. The clean name
always replaces `model`; a positive integer suffix additionally adds
`thinking: {type: "enabled", budget_tokens}` and lifts `max_tokens` /
`max_output_tokens` above the budget. Every failure leaves the body
byte-identical.
*/
use std::borrow::Cow;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

pub const PROVIDER_PREFIX: &str = "claude-";
pub const THINKING_DELIMITER: &str = "-thinking-";
/// Budgets are clamped strictly below this value; it also caps the token ceiling.
pub const HARD_CAP: i64 = 32_000;
pub const MIN_HEADROOM: i64 = 1024;

/// The two recognised max-token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenField {
    MaxTokens,
    MaxOutputTokens,
}

impl TokenField {
    pub const BOTH: [TokenField; 2] = [TokenField::MaxTokens, TokenField::MaxOutputTokens];

    pub fn as_str(self) -> &'static str {
        match self {
            TokenField::MaxTokens => "max_tokens",
            TokenField::MaxOutputTokens => "max_output_tokens",
        }
    }
}

/// What a model-name suffix asks for, derived per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingDirective {
    pub clean_model: String,
    /// Requested budget when the suffix is a positive integer (unclamped).
    pub budget: Option<i64>,
    /// Max-token field present in the original body (`max_output_tokens`
    /// only when it alone was present).
    pub present_field: Option<TokenField>,
}

/// Split `model` at the last delimiter. `None` when the prefix or delimiter is missing.
pub fn split_model(model: &str) -> Option<(&str, &str)> {
    if !model.starts_with(PROVIDER_PREFIX) {
        return None;
    }
    let idx = model.rfind(THINKING_DELIMITER)?;
    Some((&model[..idx], &model[idx + THINKING_DELIMITER.len()..]))
}

fn parse_budget(suffix: &str) -> Option<i64> {
    suffix.parse::<i64>().ok().filter(|&b| b > 0)
}

pub fn effective_budget(requested: i64) -> i64 {
    requested.min(HARD_CAP - 1)
}

/// Max-token value guaranteed to exceed `effective` while staying within the hard cap.
pub fn token_ceiling(effective: i64) -> i64 {
    let headroom = MIN_HEADROOM.max(effective / 10);
    let desired = effective.saturating_add(headroom);
    let mut ceiling = desired.min(HARD_CAP);
    if ceiling <= effective {
        ceiling = (effective + 1).min(HARD_CAP);
    }
    ceiling
}

/// Derive the directive for a parsed body, if the body carries one.
pub fn directive_for(body: &Map<String, Value>) -> Option<ThinkingDirective> {
    let model = body.get("model")?.as_str()?;
    let (clean, suffix) = split_model(model)?;
    let present_field = if body.contains_key(TokenField::MaxTokens.as_str()) {
        Some(TokenField::MaxTokens)
    } else if body.contains_key(TokenField::MaxOutputTokens.as_str()) {
        Some(TokenField::MaxOutputTokens)
    } else {
        None
    };
    Some(ThinkingDirective {
        clean_model: clean.to_string(),
        budget: parse_budget(suffix),
        present_field,
    })
}

/// Apply `directive` to `body` in place.
pub fn apply_directive(body: &mut Map<String, Value>, directive: &ThinkingDirective) {
    body.insert(
        "model".to_string(),
        Value::String(directive.clean_model.clone()),
    );
    let Some(requested) = directive.budget else {
        return;
    };

    let effective = effective_budget(requested);
    if effective != requested {
        info!(requested, effective, "clamped thinking budget below hard cap");
    }
    body.insert(
        "thinking".to_string(),
        json!({ "type": "enabled", "budget_tokens": effective }),
    );

    let ceiling = token_ceiling(effective);
    let mut numeric_seen = false;
    for field in TokenField::BOTH {
        let current = body.get(field.as_str()).and_then(Value::as_f64);
        if let Some(v) = current {
            numeric_seen = true;
            // Compared as an integer, fractional part dropped
            if (v as i64) <= effective {
                body.insert(field.as_str().to_string(), Value::from(ceiling));
            }
        }
    }
    if !numeric_seen {
        let field = directive.present_field.unwrap_or(TokenField::MaxTokens);
        body.insert(field.as_str().to_string(), Value::from(ceiling));
    }
}

/// Rewrite a request body. Returns `None` when the body must be forwarded unchanged.
pub fn rewrite_body(raw: &[u8]) -> Option<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(raw).ok()?;
    let obj = root.as_object_mut()?;
    let directive = directive_for(obj)?;
    apply_directive(obj, &directive);

    match serde_json::to_vec(&root) {
        Ok(out) => {
            match directive.budget {
                Some(b) => info!(
                    model = %directive.clean_model,
                    budget = effective_budget(b),
                    "applied thinking budget"
                ),
                None => info!(
                    model = %directive.clean_model,
                    "stripped invalid thinking suffix (no thinking)"
                ),
            }
            Some(out)
        }
        Err(e) => {
            debug!("re-serialising rewritten body failed, forwarding original: {e}");
            None
        }
    }
}

/// Body to forward for `method`: only non-empty POST bodies are considered.
pub fn transform_request_body<'a>(method: &str, raw: &'a [u8]) -> Cow<'a, [u8]> {
    if method != "POST" || raw.is_empty() {
        return Cow::Borrowed(raw);
    }
    match rewrite_body(raw) {
        Some(out) => Cow::Owned(out),
        None => Cow::Borrowed(raw),
    }
}
