//! Stop-sequence matching
//!
//! Stop sequences are tokenized once at activation and compared against the
//! tail of the rolling history after each generation step. They only ever
//! terminate model-generated runs; iterations that forwarded user input skip
//! the check entirely (the engine enforces that).

use crate::runtime::{ModelSession, RuntimeError, Token};

/// Matches the tail of the token history against configured stop sequences.
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    sequences: Vec<Vec<Token>>,
}

impl StopMatcher {
    /// Tokenizes the configured stop strings against the loaded model.
    ///
    /// Strings starting with an alphanumeric character get a leading space so
    /// they tokenize the way they appear mid-sentence. No BOS marker.
    pub fn from_strings(
        session: &dyn ModelSession,
        stop_strings: &[String],
    ) -> Result<Self, RuntimeError> {
        let mut sequences = Vec::with_capacity(stop_strings.len());
        for s in stop_strings {
            let text = match s.chars().next() {
                Some(c) if c.is_alphanumeric() => format!(" {s}"),
                _ => s.clone(),
            };
            let seq = session.tokenize(&text, false)?;
            if !seq.is_empty() {
                sequences.push(seq);
            }
        }
        Ok(Self { sequences })
    }

    /// Builds a matcher from already-tokenized sequences.
    pub fn from_sequences(sequences: Vec<Vec<Token>>) -> Self {
        Self {
            sequences: sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Returns `true` if `history` ends with any configured stop sequence.
    ///
    /// Requires exact equality of the last `len(seq)` entries; first match
    /// wins.
    pub fn matches_tail(&self, history: &[Token]) -> bool {
        self.sequences
            .iter()
            .any(|seq| history.len() >= seq.len() && history.ends_with(seq))
    }
}
