//! Pre-flight token count estimation
//!
//! The estimate feeds capacity scoring so a nearly-full provider is
//! routed around instead of hit with a quota error. It is intentionally
//! conservative: over-counting slightly shifts load away a little early,
//! under-counting produces 429s.

use crate::core::types::Message;

/// Chat-format overhead per message (role tag and separators).
const OVERHEAD_PER_MESSAGE: u64 = 4;

/// Tokens reserved for the reply primer.
const REPLY_PRIMER: u64 = 2;

/// Estimate the total token count implied by a message list.
///
/// Uses a bytes/4 ceiling per text field, which tracks cl100k-family
/// encodings closely enough for routing decisions while erring high on
/// typical prose. String passthrough fields are counted too, since they
/// are sent to the provider verbatim.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let mut total = 0u64;
    for message in messages {
        total += OVERHEAD_PER_MESSAGE;
        total += estimate_text(&message.role);
        total += estimate_text(&message.content);
        for value in message.extra.values() {
            if let Some(s) = value.as_str() {
                total += estimate_text(s);
            }
        }
    }
    total + REPLY_PRIMER
}

fn estimate_text(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}
