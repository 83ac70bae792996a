//! Scripted inference backend for unit tests
//!
//! Every prompt character becomes one `PROMPT` token. After each decode the
//! context produces one-hot logits for the next scripted piece, then EOS
//! once the script runs out. Loads, context creation and drops are written
//! to a shared event log so tests can check release ordering.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::runtime::{
    ContextParams, DecodeBatch, InferenceBackend, ModelParams, NativeContext, NativeModel, Token,
};

pub(crate) const EOS: Token = 0;

#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Script {
    /// Index 0 is EOS, then the scripted pieces, then the prompt token
    vocab: Vec<Vec<u8>>,
    n_embd: usize,
}

impl Script {
    fn prompt_token(&self) -> Token {
        (self.vocab.len() - 1) as Token
    }

    fn n_scripted(&self) -> usize {
        self.vocab.len() - 2
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    pub events: EventLog,
    pub decodes: Arc<AtomicUsize>,
    pub loads: Arc<AtomicUsize>,
    /// Parameters of every `load_model` call
    pub load_params: Mutex<Vec<ModelParams>>,
    pub fail_load: bool,
    pub fail_context: bool,
    /// Fail the n-th decode call (0 = prefill)
    pub fail_decode_at: Option<usize>,
}

impl ScriptedBackend {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        Self::from_bytes(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    pub(crate) fn from_bytes(pieces: Vec<Vec<u8>>) -> Self {
        let mut vocab = vec![b"</s>".to_vec()];
        vocab.extend(pieces);
        vocab.push(b"?".to_vec());
        Self {
            script: Script { vocab, n_embd: 8 },
            events: EventLog::default(),
            decodes: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(AtomicUsize::new(0)),
            load_params: Mutex::new(Vec::new()),
            fail_load: false,
            fail_context: false,
            fail_decode_at: None,
        }
    }

    pub(crate) fn decode_calls(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Model and context without going through the lifecycle manager
    pub(crate) fn open(&self, n_ctx: u32, embeddings: bool) -> (Box<dyn NativeModel>, Box<dyn NativeContext>) {
        let model = self.load_model(Path::new("direct.gguf"), &ModelParams::default()).unwrap();
        let context = model
            .new_context(&ContextParams {
                n_ctx,
                n_threads: 1,
                n_threads_batch: 1,
                embeddings,
            })
            .unwrap();
        (model, context)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn NativeModel>> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.load_params.lock().unwrap().push(params.clone());
        if self.fail_load {
            return Err(anyhow!("bad magic in {}", path.display()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.events.push(format!("load:{}", name));
        Ok(Box::new(ScriptedModel {
            name,
            script: self.script.clone(),
            events: self.events.clone(),
            decodes: Arc::clone(&self.decodes),
            fail_context: self.fail_context,
            fail_decode_at: self.fail_decode_at,
        }))
    }
}

struct ScriptedModel {
    name: String,
    script: Script,
    events: EventLog,
    decodes: Arc<AtomicUsize>,
    fail_context: bool,
    fail_decode_at: Option<usize>,
}

impl NativeModel for ScriptedModel {
    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<Token>> {
        Ok(text.chars().map(|_| self.script.prompt_token()).collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>> {
        self.script
            .vocab
            .get(token as usize)
            .cloned()
            .ok_or_else(|| anyhow!("token {} out of range", token))
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn n_embd(&self) -> usize {
        self.script.n_embd
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>> {
        if self.fail_context {
            return Err(anyhow!("failed to allocate kv cache"));
        }
        self.events.push(format!("context:{}", self.name));
        Ok(Box::new(ScriptedContext {
            name: self.name.clone(),
            script: self.script.clone(),
            params: params.clone(),
            events: self.events.clone(),
            decodes: Arc::clone(&self.decodes),
            fail_decode_at: self.fail_decode_at,
            steps: 0,
            seen_tokens: 0,
            logits: None,
            embedding: None,
        }))
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.events.push(format!("drop_model:{}", self.name));
    }
}

struct ScriptedContext {
    name: String,
    script: Script,
    params: ContextParams,
    events: EventLog,
    decodes: Arc<AtomicUsize>,
    fail_decode_at: Option<usize>,
    steps: usize,
    seen_tokens: usize,
    logits: Option<(usize, Vec<f32>)>,
    embedding: Option<Vec<f32>>,
}

impl NativeContext for ScriptedContext {
    fn n_ctx(&self) -> u32 {
        self.params.n_ctx
    }

    fn clear(&mut self) {
        self.steps = 0;
        self.seen_tokens = 0;
        self.logits = None;
        self.embedding = None;
    }

    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        let call = self.decodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_decode_at == Some(call) {
            return Err(anyhow!("llama_decode returned 1"));
        }
        if batch.entries().iter().any(|e| e.pos >= self.params.n_ctx) {
            return Err(anyhow!("position outside context window"));
        }

        let next = if self.steps < self.script.n_scripted() {
            (self.steps + 1) as Token
        } else {
            EOS
        };
        self.steps += 1;
        self.seen_tokens += batch.len();

        let mut logits = vec![0.0; self.script.vocab.len()];
        logits[next as usize] = 10.0;
        self.logits = batch
            .entries()
            .iter()
            .rposition(|e| e.wants_logits)
            .map(|i| (i, logits));

        if self.params.embeddings {
            let scale = self.seen_tokens as f32;
            self.embedding = Some((0..self.script.n_embd + 2).map(|i| scale + i as f32).collect());
        }
        Ok(())
    }

    fn logits_ith(&self, i: usize) -> Option<&[f32]> {
        match &self.logits {
            Some((index, logits)) if *index == i => Some(logits.as_slice()),
            _ => None,
        }
    }

    fn embeddings(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.events.push(format!("drop_context:{}", self.name));
    }
}
