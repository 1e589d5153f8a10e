//! Token counting via tiktoken, used for `FetchChunk::token_count`.
//!
//! A process-wide `o200k_base` encoder, initialized once and shared. This is
//! the *real* tokenizer the chunker reports against; the Truncator
//! (`crate::truncate`) uses a cheaper linear char/ratio estimate instead,
//! because it must stay a pure, allocation-free function of content-type
//! and length.

use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, o200k_base};

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| o200k_base().ok()).as_ref()
}

/// Thread-safe, cheap-to-construct token counter backed by a shared
/// `o200k_base` encoder. Falls back to byte length if the encoder failed
/// to initialize (vocabulary data missing/corrupt).
#[derive(Clone, Copy)]
pub(crate) struct TokenCounter {
    encoder: Option<&'static CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::warn!("tiktoken o200k_base encoder unavailable; falling back to byte-length token estimates");
        }
        Self { encoder }
    }

    #[must_use]
    pub fn count_str(&self, text: &str) -> u32 {
        let len = match self.encoder {
            Some(encoder) => encoder.encode_ordinary(text).len(),
            None => text.len(),
        };
        u32::try_from(len).unwrap_or(u32::MAX)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_str_empty() {
        assert_eq!(TokenCounter::new().count_str(""), 0);
    }

    #[test]
    fn count_str_nonempty() {
        assert!(TokenCounter::new().count_str("hello world") > 0);
    }
}
