//! Model-runtime abstraction
//!
//! The engine never talks to llama.cpp directly; it drives a [`ModelSession`]
//! created by a [`SessionFactory`]. The factory crosses into the engine
//! thread once at construction, the session is created and used exclusively
//! on that thread and never needs to be `Send`.

#[cfg(feature = "llama")]
pub mod llama_cpp;

use std::path::Path;
use thiserror::Error;

/// Token identifier from the model's vocabulary.
pub type Token = i32;

/// Errors from the model runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

/// A loaded model plus its evaluation context.
///
/// All methods are synchronous and blocking; the engine guarantees they are
/// never called concurrently on the same session.
pub trait ModelSession {
    /// Tokenizes text, optionally prepending the beginning-of-sequence
    /// marker.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, RuntimeError>;

    /// Evaluates a batch of tokens starting at position `n_past`.
    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), RuntimeError>;

    /// Logits over the vocabulary for the last evaluated position.
    fn logits(&mut self) -> &[f32];

    /// Context capacity in token positions.
    fn n_ctx(&self) -> usize;

    /// Vocabulary size.
    fn n_vocab(&self) -> usize;

    /// Textual rendering of a token.
    fn token_text(&self, token: Token) -> String;

    /// Beginning-of-sequence token id.
    fn token_bos(&self) -> Token;

    /// End-of-sequence token id.
    fn token_eos(&self) -> Token;

    /// Newline token id.
    fn token_nl(&self) -> Token;
}

/// Loads model sessions on the engine thread.
pub trait SessionFactory: Send {
    /// Loads a model from `path` and creates its evaluation context.
    fn load(&mut self, path: &Path) -> Result<Box<dyn ModelSession>, RuntimeError>;
}

/// Heap slot with a stable address for owner/borrower pairs that move
/// together (a context holding a reference into the model it was created
/// from, stored in the same struct).
///
/// The value is boxed once and addressed through the raw allocation pointer
/// from then on. References handed out by [`StableBox::get`] and
/// [`StableBox::get_extended`] are derived from that pointer, never from a
/// live `Box`, so moving the `StableBox` handle does not invalidate them.
/// The allocation is freed when the handle drops.
pub struct StableBox<T> {
    ptr: *mut T,
}

impl<T> StableBox<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: Box::into_raw(Box::new(value)),
        }
    }

    pub fn get(&self) -> &T {
        // SAFETY: `ptr` came from `Box::into_raw` and is freed only in Drop.
        unsafe { &*self.ptr }
    }

    /// Borrows the value at an arbitrary lifetime.
    ///
    /// # Safety
    ///
    /// The caller must drop every extended reference before this `StableBox`
    /// drops, and must not create a mutable reference while one is live.
    pub unsafe fn get_extended<'a>(&self) -> &'a T {
        &*self.ptr
    }
}

impl<T> Drop for StableBox<T> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::into_raw` and is reconstituted
        // exactly once.
        unsafe { drop(Box::from_raw(self.ptr)) }
    }
}
