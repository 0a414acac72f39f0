//! Token estimation.
//!
//! A rough `bytes / 4` approximation over the UTF-8 encoding. It is used
//! for every budget and metric in the system, so the same text always costs
//! the same amount regardless of which agent or store produced it.

/// Estimate the token count of `text` as `ceil(bytes / 4)`; empty text costs 0.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Sum of [`estimate_tokens`] over each segment. Segments are costed
/// independently; no separator overhead is added.
pub fn estimate_segments<S: AsRef<str>>(segments: &[S]) -> usize {
    segments.iter().map(|s| estimate_tokens(s.as_ref())).sum()
}
