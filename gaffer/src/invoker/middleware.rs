//! Compressive conversation middleware.
//!
//! Long tool-loop conversations (the implementor especially) grow past what
//! a role budget tolerates. At the configured threshold the middleware
//! replaces the older half of the conversation with a summariser-produced
//! digest, keeping the leading system prompt and the last
//! [`KEEP_LAST_TURNS`] turns verbatim.

use std::sync::Arc;
use tracing::{debug, warn};

use super::chat::{
    estimate_conversation_tokens, ChatMessage, ChatModel, ChatRequest,
};

/// Turns kept verbatim at the tail of a compressed conversation.
pub const KEEP_LAST_TURNS: usize = 10;

/// Summarisation middleware bound to the summariser role.
pub struct SummarizationMiddleware {
    summarizer: Arc<dyn ChatModel>,
    threshold_tokens: usize,
}

impl SummarizationMiddleware {
    #[must_use]
    pub fn new(summarizer: Arc<dyn ChatModel>, threshold_tokens: usize) -> Self {
        Self {
            summarizer,
            threshold_tokens,
        }
    }

    #[must_use]
    pub fn threshold_tokens(&self) -> usize {
        self.threshold_tokens
    }

    /// Whether a conversation is over the compression threshold.
    #[must_use]
    pub fn over_threshold(&self, messages: &[ChatMessage]) -> bool {
        estimate_conversation_tokens(messages) >= self.threshold_tokens
    }

    /// Compress in place when over threshold. Returns `true` when the
    /// conversation was rewritten.
    ///
    /// Layout after compression: `[system?, digest, last-10 turns…]`. When
    /// the summariser itself fails the conversation is left untouched and
    /// the caller's budget check decides what happens next.
    pub async fn compress(&self, messages: &mut Vec<ChatMessage>) -> bool {
        if !self.over_threshold(messages) {
            return false;
        }

        let system: Vec<ChatMessage> = messages
            .iter()
            .take(1)
            .filter(|m| m.role == ChatMessage::SYSTEM)
            .cloned()
            .collect();
        let body_start = system.len();
        if messages.len() <= body_start + KEEP_LAST_TURNS {
            return false;
        }
        let tail_start = messages.len() - KEEP_LAST_TURNS;
        let older = &messages[body_start..tail_start];

        let transcript: String = older
            .iter()
            .map(|m| format!("[{}] {}\n", m.role, m.content))
            .collect();
        let prompt = format!(
            "Summarise this working transcript into a compact digest. Preserve every file \
             path, decision, and unresolved problem; drop pleasantries and duplicated tool \
             output.\n\n{transcript}"
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)]);
        let digest = match self.summarizer.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => response.content,
            Ok(_) => {
                warn!("summariser returned empty digest; conversation left unchanged");
                return false;
            }
            Err(error) => {
                warn!(%error, "summariser failed; conversation left unchanged");
                return false;
            }
        };

        let before = estimate_conversation_tokens(messages);
        let mut rebuilt = system;
        rebuilt.push(ChatMessage::assistant(format!(
            "Conversation digest (older turns compressed):\n{digest}"
        )));
        rebuilt.extend_from_slice(&messages[tail_start..]);
        *messages = rebuilt;
        debug!(
            before_tokens = before,
            after_tokens = estimate_conversation_tokens(messages),
            "conversation compressed"
        );
        true
    }
}
