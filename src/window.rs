//! Context-window management
//!
//! Tracks how many token positions the model has evaluated against its fixed
//! context capacity, and maintains the rolling last-N-tokens history used for
//! repetition penalties and stop-sequence matching.

use crate::runtime::Token;

/// Fixed-size sliding window over the most recent tokens.
///
/// Always holds exactly the context capacity worth of entries, zero-filled at
/// session start. Pushing a token evicts exactly the oldest entry, one token
/// at a time. Multi-token batches must be pushed per token so the window
/// stays in sync with the token stream.
#[derive(Debug, Clone)]
pub struct RollingHistory {
    tokens: Vec<Token>,
}

impl RollingHistory {
    /// Creates a zero-filled history of exactly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: vec![0; capacity],
        }
    }

    /// Pushes a token, evicting the oldest entry.
    pub fn push(&mut self, token: Token) {
        self.tokens.remove(0);
        self.tokens.push(token);
    }

    /// All entries, oldest first.
    pub fn as_slice(&self) -> &[Token] {
        &self.tokens
    }

    /// The most recent `n` entries (fewer if `n` exceeds the capacity).
    pub fn tail(&self, n: usize) -> &[Token] {
        let start = self.tokens.len().saturating_sub(n);
        &self.tokens[start..]
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// What to do when the next batch would push `n_past` beyond the context
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OverflowPolicy {
    /// Evict the middle of history and keep generating indefinitely.
    Slide,
    /// Treat a full context as terminal for the session.
    Stop,
}

/// Tracks evaluated positions against the model's context capacity.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    n_ctx: usize,
    n_keep: usize,
    n_past: usize,
}

impl ContextWindow {
    pub fn new(n_ctx: usize, n_keep: usize) -> Self {
        Self {
            n_ctx,
            n_keep,
            n_past: 0,
        }
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Largest batch the model accepts in one go. Matches the headroom the
    /// llama.cpp command-line prompt handling reserves.
    pub fn max_batch(&self) -> usize {
        self.n_ctx.saturating_sub(4)
    }

    /// Truncates an oversized batch from the front, keeping the most recent
    /// tokens. Returns how many tokens were skipped.
    pub fn truncate_batch(&self, batch: &mut Vec<Token>) -> usize {
        let max = self.max_batch();
        if batch.len() <= max {
            return 0;
        }
        let skipped = batch.len() - max;
        batch.drain(..skipped);
        skipped
    }

    /// Returns `true` if evaluating `len` more tokens would exceed capacity.
    pub fn would_overflow(&self, len: usize) -> bool {
        self.n_past + len > self.n_ctx
    }

    /// Sliding-window eviction: keep the first `n_keep` positions, rewind
    /// `n_past`, and prefix the batch with roughly half of the recent history
    /// so generation can continue with fresh context.
    ///
    /// All index arithmetic is clamped; small contexts or large batches
    /// degrade to replaying less history rather than panicking.
    pub fn slide(&mut self, batch: &mut Vec<Token>, history: &RollingHistory) {
        let n_left = self.n_past.saturating_sub(self.n_keep);
        // Always keep at least position 0, where BOS lives.
        self.n_past = self.n_keep.max(1);

        let hist = history.as_slice();
        let end = hist.len().saturating_sub(batch.len());
        let start = end.saturating_sub(n_left / 2);
        batch.splice(0..0, hist[start..end].iter().copied());
    }

    /// Records that `len` positions were evaluated.
    pub fn advance(&mut self, len: usize) {
        self.n_past += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_fixed_length() {
        let mut history = RollingHistory::new(8);
        assert_eq!(history.len(), 8);
        assert_eq!(history.as_slice(), &[0; 8]);

        for t in 1..=20 {
            history.push(t);
            assert_eq!(history.len(), 8);
        }
        assert_eq!(history.as_slice(), &[13, 14, 15, 16, 17, 18, 19, 20]);
    }

    #[test]
    fn test_history_push_evicts_oldest() {
        let mut history = RollingHistory::new(3);
        history.push(1);
        history.push(2);
        assert_eq!(history.as_slice(), &[0, 1, 2]);
        history.push(3);
        assert_eq!(history.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_history_tail() {
        let mut history = RollingHistory::new(4);
        for t in 1..=4 {
            history.push(t);
        }
        assert_eq!(history.tail(2), &[3, 4]);
        assert_eq!(history.tail(10), &[1, 2, 3, 4]);
        assert_eq!(history.tail(0), &[] as &[Token]);
    }

    #[test]
    fn test_truncate_batch_keeps_most_recent() {
        let window = ContextWindow::new(8, 0);
        let mut batch: Vec<Token> = (0..10).collect();
        let skipped = window.truncate_batch(&mut batch);
        assert_eq!(skipped, 6);
        assert_eq!(batch, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_truncate_batch_noop_when_fits() {
        let window = ContextWindow::new(16, 0);
        let mut batch: Vec<Token> = (0..4).collect();
        assert_eq!(window.truncate_batch(&mut batch), 0);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_slide_resets_n_past() {
        let mut window = ContextWindow::new(8, 0);
        window.advance(8);

        let mut history = RollingHistory::new(8);
        for t in 1..=8 {
            history.push(t);
        }

        let mut batch = vec![100];
        assert!(window.would_overflow(batch.len()));
        window.slide(&mut batch, &history);

        // n_keep = 0 always keeps position 0.
        assert_eq!(window.n_past(), 1);
        // Half of n_left = 8 history tokens, taken from just before the batch.
        assert_eq!(batch, vec![4, 5, 6, 7, 100]);
    }

    #[test]
    fn test_slide_respects_n_keep() {
        let mut window = ContextWindow::new(8, 2);
        window.advance(8);

        let history = RollingHistory::new(8);
        let mut batch = vec![1];
        window.slide(&mut batch, &history);
        assert_eq!(window.n_past(), 2);
    }

    #[test]
    fn test_slide_clamps_small_context() {
        // Batch larger than history minus replay window: must not panic.
        let mut window = ContextWindow::new(4, 0);
        window.advance(4);

        let mut history = RollingHistory::new(4);
        for t in 1..=4 {
            history.push(t);
        }

        let mut batch = vec![9, 9, 9];
        window.slide(&mut batch, &history);
        assert_eq!(window.n_past(), 1);
        assert_eq!(&batch[batch.len() - 3..], &[9, 9, 9]);
    }
}
