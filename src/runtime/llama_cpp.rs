//! llama.cpp backend
//!
//! Implements the model-runtime contract over the `llama-cpp-2` crate.
//! llama-cpp types contain raw pointers that are not `Send`; the session is
//! created and used entirely on the engine thread, only the factory crosses
//! the thread boundary.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::runtime::{ModelSession, RuntimeError, SessionFactory, StableBox, Token};

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Global llama.cpp backend (can only be initialized once per process).
static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend, RuntimeError> {
    let result = BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    result
        .as_ref()
        .map_err(|e| RuntimeError::ModelLoad(format!("failed to init llama backend: {e}")))
}

/// Cheap GGUF header check before handing the path to llama.cpp, so an
/// obviously broken file fails with a clear error instead of a native one.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<(), RuntimeError> {
    let mut file =
        File::open(path.as_ref()).map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;

    let size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    if size < 24 {
        return Err(RuntimeError::ModelLoad("file too small to be GGUF".into()));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;

    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
    let magic = u32::from_le_bytes(buf);
    if magic != GGUF_MAGIC {
        return Err(RuntimeError::ModelLoad(format!(
            "not a GGUF file (magic 0x{magic:08X})"
        )));
    }

    file.read_exact(&mut buf)
        .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
    let version = u32::from_le_bytes(buf);
    if !(2..=3).contains(&version) {
        return Err(RuntimeError::ModelLoad(format!(
            "unsupported GGUF version {version}"
        )));
    }

    Ok(())
}

/// Loads llama.cpp sessions on the engine thread.
#[derive(Debug, Clone)]
pub struct LlamaCppFactory {
    /// Context capacity in token positions.
    pub n_ctx: u32,
    /// Decode batch capacity.
    pub n_batch: u32,
    /// Evaluation threads, for both prompt and generation batches.
    pub n_threads: u32,
    /// Layers offloaded to the GPU.
    pub n_gpu_layers: u32,
}

impl Default for LlamaCppFactory {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: 8,
            n_gpu_layers: 50,
        }
    }
}

impl SessionFactory for LlamaCppFactory {
    fn load(&mut self, path: &Path) -> Result<Box<dyn ModelSession>, RuntimeError> {
        validate_gguf(path)?;
        let backend = backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(self.n_gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
        let model = StableBox::new(model);

        let n_ctx = NonZeroU32::new(self.n_ctx)
            .ok_or_else(|| RuntimeError::ContextCreate("n_ctx must be non-zero".into()))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.n_batch)
            .with_n_threads(self.n_threads as i32)
            .with_n_threads_batch(self.n_threads as i32);

        // SAFETY: the reference is derived from the model's stable heap slot
        // and stored in the same session as the slot, where field order drops
        // the context before the model.
        let model_ref: &'static LlamaModel = unsafe { model.get_extended() };
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .map_err(|e| RuntimeError::ContextCreate(e.to_string()))?;

        tracing::info!(
            path = %path.display(),
            n_ctx = self.n_ctx,
            n_threads = self.n_threads,
            n_vocab = model.get().n_vocab(),
            "llama model loaded"
        );

        Ok(Box::new(LlamaCppSession {
            ctx,
            model,
            n_ctx: self.n_ctx as usize,
            n_batch: self.n_batch as usize,
        }))
    }
}

/// A loaded llama.cpp model plus its evaluation context.
pub struct LlamaCppSession {
    // Field order matters: the context must drop before the model it
    // borrows.
    ctx: LlamaContext<'static>,
    model: StableBox<LlamaModel>,
    n_ctx: usize,
    n_batch: usize,
}

impl ModelSession for LlamaCppSession {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, RuntimeError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .get()
            .str_to_token(text, add_bos)
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize) -> Result<(), RuntimeError> {
        let mut batch = LlamaBatch::new(self.n_batch.max(tokens.len()), 1);
        for (i, &token) in tokens.iter().enumerate() {
            let is_last = i == tokens.len() - 1;
            batch
                .add(LlamaToken(token), (n_past + i) as i32, &[0], is_last)
                .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
        }
        self.ctx
            .decode(&mut batch)
            .map_err(|e| RuntimeError::Evaluation(e.to_string()))
    }

    fn logits(&mut self) -> &[f32] {
        self.ctx.get_logits()
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_vocab(&self) -> usize {
        self.model.get().n_vocab() as usize
    }

    fn token_text(&self, token: Token) -> String {
        match self.model.get().token_to_bytes(LlamaToken(token), Special::Tokenize) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("failed to render token {token}: {e}");
                String::new()
            }
        }
    }

    fn token_bos(&self) -> Token {
        self.model.get().token_bos().0
    }

    fn token_eos(&self) -> Token {
        self.model.get().token_eos().0
    }

    fn token_nl(&self) -> Token {
        self.model.get().token_nl().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_factory_defaults() {
        let factory = LlamaCppFactory::default();
        assert_eq!(factory.n_ctx, 4096);
        assert_eq!(factory.n_batch, 512);
        assert_eq!(factory.n_threads, 8);
        assert_eq!(factory.n_gpu_layers, 50);
    }

    #[test]
    fn test_validate_gguf_valid_header() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap();
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();

        assert!(validate_gguf(file.path()).is_ok());
    }

    #[test]
    fn test_validate_gguf_bad_magic() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap();
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();

        assert!(validate_gguf(file.path()).is_err());
    }

    #[test]
    fn test_validate_gguf_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        assert!(validate_gguf(file.path()).is_err());
    }
}
