//! llama.cpp runtime via `llama-cpp-2` (feature `llama`)
//!
//! `LlamaContext` borrows its model and is not `Send`, so each context
//! lives on its own worker thread together with a clone of the model
//! handle. The engine side talks to it over a channel and keeps a copy of
//! the logits and pooled vector from the last decode.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use super::runtime::{
    ContextParams, DecodeBatch, InferenceBackend, ModelParams, NativeContext, NativeModel, Token,
};

// llama.cpp allows one backend per process. Callers share it; it is freed
// when the last backend, model and context handle is gone.
static SHARED_BACKEND: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());

fn shared_backend() -> Result<Arc<LlamaBackend>> {
    let mut guard = SHARED_BACKEND.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(backend) = guard.upgrade() {
        return Ok(backend);
    }
    let backend = LlamaBackend::init().map_err(|e| anyhow!("Failed to init llama backend: {}", e))?;
    let backend = Arc::new(backend);
    *guard = Arc::downgrade(&backend);
    log::info!("llama.cpp backend initialized");
    Ok(backend)
}

/// [`InferenceBackend`] that loads GGUF weights with llama.cpp
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            backend: shared_backend()?,
        })
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn NativeModel>> {
        let mut native_params = LlamaModelParams::default();
        if let Some(layers) = params.n_gpu_layers {
            native_params = native_params.with_n_gpu_layers(layers);
        }

        let model = LlamaModel::load_from_file(&self.backend, path, &native_params)
            .map_err(|e| anyhow!("llama.cpp could not load {}: {}", path.display(), e))?;
        log::info!(
            "llama.cpp model loaded: {} (n_embd={}, gpu_layers={:?})",
            path.display(),
            model.n_embd(),
            params.n_gpu_layers
        );

        Ok(Box::new(LlamaCppModel {
            model: Arc::new(model),
            backend: Arc::clone(&self.backend),
        }))
    }
}

struct LlamaCppModel {
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
}

impl NativeModel for LlamaCppModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| anyhow!("tokenize failed: {}", e))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| anyhow!("token {} has no piece: {}", token, e))
    }

    fn eos_token(&self) -> Token {
        self.model.token_eos().0
    }

    fn n_embd(&self) -> usize {
        self.model.n_embd().max(0) as usize
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>> {
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let model = Arc::clone(&self.model);
        let backend = Arc::clone(&self.backend);
        let worker_params = params.clone();

        let worker = std::thread::Builder::new()
            .name("llama-context".to_string())
            .spawn(move || run_worker(model, backend, worker_params, ready_tx, inbox))
            .context("Failed to spawn llama context thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(LlamaCppContext {
                n_ctx: params.n_ctx,
                commands: Some(commands),
                worker: Some(worker),
                last: DecodeOutput::default(),
            })),
            Ok(Err(e)) => {
                worker.join().ok();
                Err(e)
            }
            Err(_) => {
                worker.join().ok();
                Err(anyhow!("llama context thread exited during setup"))
            }
        }
    }
}

enum Command {
    Clear,
    Decode {
        batch: DecodeBatch,
        reply: Sender<Result<DecodeOutput>>,
    },
}

#[derive(Default)]
struct DecodeOutput {
    /// (batch index, logits) for entries that asked for them
    logits: Vec<(usize, Vec<f32>)>,
    pooled: Option<Vec<f32>>,
}

/// Owns the native context for its whole life
fn run_worker(
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
    params: ContextParams,
    ready: Sender<Result<()>>,
    inbox: Receiver<Command>,
) {
    let context_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_ctx))
        .with_n_batch(params.n_ctx)
        .with_n_ubatch(params.n_ctx)
        .with_n_threads(params.n_threads as i32)
        .with_n_threads_batch(params.n_threads_batch as i32)
        .with_embeddings(params.embeddings);

    let mut context = match model.new_context(&backend, context_params) {
        Ok(context) => context,
        Err(e) => {
            ready.send(Err(anyhow!("Failed to create llama context: {}", e))).ok();
            return;
        }
    };
    ready.send(Ok(())).ok();
    drop(ready);

    while let Ok(command) = inbox.recv() {
        match command {
            Command::Clear => context.clear_kv_cache(),
            Command::Decode { batch, reply } => {
                reply.send(decode_on(&mut context, &batch, params.embeddings)).ok();
            }
        }
    }
    log::debug!("llama context thread exiting");
}

fn decode_on(context: &mut LlamaContext<'_>, batch: &DecodeBatch, embeddings: bool) -> Result<DecodeOutput> {
    let mut native = LlamaBatch::new(batch.len().max(1), 1);
    for entry in batch.entries() {
        native.add(LlamaToken(entry.token), entry.pos as i32, &[0], entry.wants_logits)?;
    }
    context.decode(&mut native)?;

    let mut output = DecodeOutput::default();
    if embeddings {
        let pooled = match context.embeddings_seq_ith(0) {
            Ok(vector) => vector.to_vec(),
            // models without pooling expose per-token vectors only
            Err(_) => context.embeddings_ith(batch.len() as i32 - 1)?.to_vec(),
        };
        output.pooled = Some(pooled);
    } else {
        for (i, entry) in batch.entries().iter().enumerate() {
            if entry.wants_logits {
                output.logits.push((i, context.get_logits_ith(i as i32).to_vec()));
            }
        }
    }
    Ok(output)
}

/// Engine-side handle to a context worker
struct LlamaCppContext {
    n_ctx: u32,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    last: DecodeOutput,
}

impl LlamaCppContext {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| anyhow!("llama context is closed"))?
            .send(command)
            .map_err(|_| anyhow!("llama context thread exited"))
    }
}

impl NativeContext for LlamaCppContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn clear(&mut self) {
        self.last = DecodeOutput::default();
        if let Err(e) = self.send(Command::Clear) {
            log::warn!("Could not clear llama context: {:#}", e);
        }
    }

    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        self.last = DecodeOutput::default();
        let (reply, response) = mpsc::channel();
        self.send(Command::Decode {
            batch: batch.clone(),
            reply,
        })?;
        self.last = response
            .recv()
            .map_err(|_| anyhow!("llama context thread exited mid-decode"))??;
        Ok(())
    }

    fn logits_ith(&self, i: usize) -> Option<&[f32]> {
        self.last
            .logits
            .iter()
            .find(|(index, _)| *index == i)
            .map(|(_, logits)| logits.as_slice())
    }

    fn embeddings(&self) -> Option<&[f32]> {
        self.last.pooled.as_deref()
    }
}

impl Drop for LlamaCppContext {
    fn drop(&mut self) {
        // Closing the channel ends the worker, which frees the native
        // context before this returns.
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("llama context thread panicked");
            }
        }
    }
}
