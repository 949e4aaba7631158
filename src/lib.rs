//! llamatick
//!
//! A streaming, stateful text-generation engine for llama.cpp models. A
//! dedicated engine thread owns the model and runs the generation loop; the
//! host drives a periodic tick that drains generated tokens and can inject
//! new input mid-generation. The two sides communicate only through
//! thread-safe work queues, so neither ever blocks on the other.
//!
//! ```no_run
//! use llamatick::{ActivateParams, Engine};
//! # use llamatick::runtime::{ModelSession, RuntimeError, SessionFactory};
//! # struct NoModel;
//! # impl SessionFactory for NoModel {
//! #     fn load(&mut self, _: &std::path::Path) -> Result<Box<dyn ModelSession>, RuntimeError> {
//! #         Err(RuntimeError::ModelLoad("no model".into()))
//! #     }
//! # }
//! # fn factory() -> impl SessionFactory + 'static { NoModel }
//!
//! let engine = Engine::new(factory());
//! engine.activate(false, ActivateParams {
//!     prompt: "Hello".into(),
//!     model_path: "model.gguf".into(),
//!     stop_sequences: vec!["User:".into()],
//! });
//!
//! loop {
//!     engine.process(|token| print!("{token}"));
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! ```

pub mod engine;
pub mod queue;
pub mod runtime;
pub mod sampler;
pub mod stop;
pub mod window;

pub use engine::{ActivateParams, Engine, EngineConfig};
pub use sampler::{MirostatMode, SamplingParams};
pub use window::OverflowPolicy;
