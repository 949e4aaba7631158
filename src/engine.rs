//! Inference engine
//!
//! The caller-visible [`Engine`] handle and the private worker loop behind
//! it.
//!
//! # Architecture
//!
//! Model state (the session) is owned exclusively by a dedicated engine
//! thread spawned at construction and joined on drop. The handle never
//! touches the session: `activate` / `deactivate` / `insert_prompt` enqueue
//! requests on the caller→engine queue, and the engine enqueues rendered
//! tokens on the engine→caller queue for `process` to drain on the host's
//! own schedule. Neither thread ever blocks waiting on the other.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::WorkQueue;
use crate::runtime::{ModelSession, SessionFactory, Token};
use crate::sampler::{Sampler, SamplingParams};
use crate::stop::StopMatcher;
use crate::window::{ContextWindow, OverflowPolicy, RollingHistory};

/// Caller-supplied configuration, valid at activation time only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateParams {
    /// Initial prompt text.
    pub prompt: String,
    /// Path to the model file.
    pub model_path: PathBuf,
    /// Strings whose token sequences end a generation run.
    pub stop_sequences: Vec<String>,
}

/// Engine-wide configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sampling: SamplingParams,
    /// Evaluation chunk size.
    pub n_batch: usize,
    /// Prefix positions preserved across sliding-window eviction.
    pub n_keep: usize,
    /// What to do when generation would overflow the context.
    pub overflow: OverflowPolicy,
    /// How long the engine thread sleeps when it has nothing to do.
    pub idle_sleep: Duration,
    /// RNG seed for sampling; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            n_batch: 512,
            n_keep: 0,
            overflow: OverflowPolicy::Slide,
            idle_sleep: Duration::from_millis(200),
            seed: None,
        }
    }
}

/// Requests crossing from the caller to the engine thread.
enum EngineRequest {
    Activate { reset: bool, params: ActivateParams },
    InsertPrompt { text: String },
    Deactivate,
}

/// Handle to the engine thread.
///
/// Cheap to construct before any model is loaded; dropping it signals the
/// thread and joins it, which performs a final deactivation.
pub struct Engine {
    requests: Arc<WorkQueue<EngineRequest>>,
    results: Arc<WorkQueue<String>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the engine thread with default configuration.
    pub fn new(factory: impl SessionFactory + 'static) -> Self {
        Self::with_config(factory, EngineConfig::default())
    }

    /// Spawns the engine thread.
    pub fn with_config(factory: impl SessionFactory + 'static, config: EngineConfig) -> Self {
        let requests = Arc::new(WorkQueue::new());
        let results = Arc::new(WorkQueue::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let requests = Arc::clone(&requests);
            let results = Arc::clone(&results);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                Worker {
                    factory,
                    config,
                    requests,
                    results,
                    running,
                    session: None,
                }
                .run()
            })
        };

        Self {
            requests,
            results,
            running,
            worker: Some(worker),
        }
    }

    /// Requests model activation.
    ///
    /// With `reset` set, any loaded model is torn down first; otherwise an
    /// already-loaded model makes this a no-op. The prompt is tokenized with
    /// a leading space and a beginning-of-sequence marker; activation fails
    /// (logged, session unloaded) if it exceeds the context capacity minus 4.
    pub fn activate(&self, reset: bool, params: ActivateParams) {
        self.requests.push(EngineRequest::Activate { reset, params });
    }

    /// Requests model teardown. Idempotent.
    pub fn deactivate(&self) {
        self.requests.push(EngineRequest::Deactivate);
    }

    /// Appends text to the pending input, mid-generation.
    ///
    /// Logged and ignored when no model is active.
    pub fn insert_prompt(&self, text: impl Into<String>) {
        self.requests.push(EngineRequest::InsertPrompt { text: text.into() });
    }

    /// Drains currently-queued generated tokens, invoking `deliver` with each
    /// rendered token in generation order. Never blocks on the engine thread.
    pub fn process<F: FnMut(String)>(&self, mut deliver: F) {
        while self.results.process_one(|token| deliver(token)) {}
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Mutable state owned by the engine thread for one activation.
struct GenState {
    model: Box<dyn ModelSession>,
    window: ContextWindow,
    history: RollingHistory,
    stop: StopMatcher,
    sampler: Sampler,
    /// Pending input tokens, appended to by `insert_prompt`.
    embd_inp: Vec<Token>,
    /// Batch staged for the next evaluation.
    embd: Vec<Token>,
    /// Index of the next unconsumed input token.
    n_consumed: usize,
    eos: bool,
}

struct Worker<F> {
    factory: F,
    config: EngineConfig,
    requests: Arc<WorkQueue<EngineRequest>>,
    results: Arc<WorkQueue<String>>,
    running: Arc<AtomicBool>,
    session: Option<GenState>,
}

impl<F: SessionFactory> Worker<F> {
    fn run(mut self) {
        tracing::debug!("engine thread running");
        while self.running.load(Ordering::Relaxed) {
            let requests = Arc::clone(&self.requests);
            while requests.process_one(|request| self.handle_request(request)) {}

            if !self.step() {
                self.deactivate();
            }
        }
        self.deactivate();
        tracing::debug!("engine thread stopped");
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Activate { reset, params } => self.activate(reset, params),
            EngineRequest::InsertPrompt { text } => self.insert_prompt(&text),
            EngineRequest::Deactivate => self.deactivate(),
        }
    }

    fn activate(&mut self, reset: bool, params: ActivateParams) {
        tracing::info!(path = %params.model_path.display(), reset, "activating model");
        if reset {
            self.deactivate();
        }
        if self.session.is_some() {
            tracing::debug!("model already loaded, activate is a no-op");
            return;
        }

        let mut model = match self.factory.load(&params.model_path) {
            Ok(model) => model,
            Err(e) => {
                tracing::error!("unable to load model: {e}");
                return;
            }
        };
        let n_ctx = model.n_ctx();

        let prompt = format!(" {}", params.prompt);
        let embd_inp = match model.tokenize(&prompt, true) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("failed to tokenize prompt: {e}");
                return;
            }
        };
        let stop = match StopMatcher::from_strings(model.as_ref(), &params.stop_sequences) {
            Ok(stop) => stop,
            Err(e) => {
                tracing::error!("failed to tokenize stop sequences: {e}");
                return;
            }
        };

        if embd_inp.len() > n_ctx.saturating_sub(4) {
            tracing::error!(
                "prompt is too long ({} tokens, max {})",
                embd_inp.len(),
                n_ctx.saturating_sub(4)
            );
            return;
        }

        // Warm-up evaluation of BOS at position 0.
        let bos = model.token_bos();
        if let Err(e) = model.evaluate(&[bos], 0) {
            tracing::warn!("warm-up evaluation failed: {e}");
        }

        self.session = Some(GenState {
            window: ContextWindow::new(n_ctx, self.config.n_keep),
            history: RollingHistory::new(n_ctx),
            stop,
            sampler: Sampler::new(self.config.sampling.clone(), self.config.seed),
            embd_inp,
            embd: Vec::new(),
            n_consumed: 0,
            eos: false,
            model,
        });
        tracing::info!("model activated");
    }

    fn deactivate(&mut self) {
        if self.session.take().is_some() {
            tracing::info!("unloading model");
        }
    }

    fn insert_prompt(&mut self, text: &str) {
        let Some(session) = self.session.as_mut() else {
            tracing::error!("insert_prompt with no model active");
            return;
        };
        let text = format!(" {text}");
        match session.model.tokenize(&text, false) {
            Ok(tokens) => session.embd_inp.extend(tokens),
            Err(e) => tracing::error!("failed to tokenize inserted prompt: {e}"),
        }
    }

    /// One generation-loop iteration. Returns `false` when the session must
    /// be torn down.
    fn step(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            thread::sleep(self.config.idle_sleep);
            return true;
        };

        if session.eos && session.embd_inp.len() <= session.n_consumed {
            thread::sleep(self.config.idle_sleep);
            return true;
        }
        session.eos = false;

        if !session.embd.is_empty() {
            let skipped = session.window.truncate_batch(&mut session.embd);
            if skipped > 0 {
                tracing::error!("input too long: skipped {skipped} tokens");
            }

            if session.window.would_overflow(session.embd.len()) {
                if self.config.overflow == OverflowPolicy::Stop {
                    tracing::error!("context full, stopping generation");
                    return false;
                }
                tracing::warn!("context full, resetting via sliding window");
                session.window.slide(&mut session.embd, &session.history);
            }

            let GenState { model, embd, window, .. } = &mut *session;
            for chunk in embd.chunks(self.config.n_batch) {
                if let Err(e) = model.evaluate(chunk, window.n_past()) {
                    tracing::error!("failed to eval: {e}");
                    return false;
                }
                window.advance(chunk.len());
            }
        }

        session.embd.clear();
        let mut have_human_tokens = false;

        if session.embd_inp.len() <= session.n_consumed {
            // Out of user input: sample the next token.
            let GenState { model, sampler, history, embd, .. } = &mut *session;
            let nl_token = model.token_nl();
            let id = sampler.sample(model.logits(), history.as_slice(), nl_token);
            history.push(id);
            embd.push(id);
        } else {
            // Forward pending input, one history push per token.
            while session.embd_inp.len() > session.n_consumed {
                let token = session.embd_inp[session.n_consumed];
                session.embd.push(token);
                session.history.push(token);
                have_human_tokens = true;
                session.n_consumed += 1;
                if session.embd.len() >= self.config.n_batch {
                    break;
                }
            }
        }

        for &id in &session.embd {
            self.results.push(session.model.token_text(id));
        }

        // Stop sequences only terminate model-generated runs, never
        // user-supplied continuations.
        let hit_stop = !have_human_tokens
            && !session.stop.is_empty()
            && session.stop.matches_tail(session.history.as_slice());

        if session.embd.last().copied() == Some(session.model.token_eos()) || hit_stop {
            tracing::debug!("end of sequence");
            session.eos = true;
        }

        true
    }
}
