//! Autoregressive decode loop
//!
//! Prefill the prompt, then sample one token at a time until EOS, a stop
//! string, the token budget, or the end of the context window. Synchronous
//! and streaming callers share this loop; the synchronous path simply
//! collects what the streaming path would have delivered.

use super::provider::{CompletionRequest, FinishReason, LlmError};
use super::runtime::{DecodeBatch, NativeContext, NativeModel};
use super::sampling::SamplingPipeline;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Joins token pieces into valid UTF-8. A character split across tokens
/// is held until its remaining bytes arrive; invalid sequences become
/// U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete trailing character, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Whatever is left once generation ends
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Text that can no longer become part of a stop string
    Emit(String),
    /// A stop string appeared; carries the text before it
    Stop(String),
}

/// Matches stop strings against the accumulated output.
///
/// The longest suffix of the output that is still a prefix of some stop
/// string is held back, so a stop string split over several tokens is
/// never partially delivered.
#[derive(Debug, Default)]
pub(crate) struct StopScanner {
    stops: Vec<String>,
    held: String,
}

impl StopScanner {
    pub(crate) fn new(stops: Option<&[String]>) -> Self {
        let stops = stops
            .unwrap_or_default()
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        Self {
            stops,
            held: String::new(),
        }
    }

    pub(crate) fn push(&mut self, fragment: &str) -> Scan {
        if self.stops.is_empty() {
            return Scan::Emit(fragment.to_string());
        }
        self.held.push_str(fragment);

        let first_match = self.stops.iter().filter_map(|s| self.held.find(s.as_str())).min();
        if let Some(index) = first_match {
            let before = self.held[..index].to_string();
            self.held.clear();
            return Scan::Stop(before);
        }

        let keep = self.partial_suffix_len();
        let ready: String = self.held.drain(..self.held.len() - keep).collect();
        Scan::Emit(ready)
    }

    pub(crate) fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    fn partial_suffix_len(&self) -> usize {
        self.stops
            .iter()
            .filter_map(|stop| {
                (1..stop.len())
                    .rev()
                    .filter(|&k| stop.is_char_boundary(k))
                    .find(|&k| self.held.ends_with(&stop[..k]))
            })
            .max()
            .unwrap_or(0)
    }
}

fn deliver<F: FnMut(&str)>(text: &mut String, on_chunk: &mut F, chunk: &str) {
    if !chunk.is_empty() {
        text.push_str(chunk);
        on_chunk(chunk);
    }
}

/// Run one request against a loaded model/context pair. `on_chunk` sees
/// every text fragment in order before this returns. On error, fragments
/// already delivered stand.
pub(crate) fn generate<F: FnMut(&str)>(
    model: &dyn NativeModel,
    context: &mut dyn NativeContext,
    max_output_tokens: u32,
    request: &CompletionRequest,
    mut on_chunk: F,
) -> Result<GenerationOutcome, LlmError> {
    let budget = request
        .max_tokens
        .map_or(max_output_tokens, |m| m.min(max_output_tokens));
    if budget == 0 {
        return Ok(GenerationOutcome {
            text: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            finish_reason: FinishReason::Length,
        });
    }

    let tokens = model
        .tokenize(&request.prompt, true)
        .map_err(|e| LlmError::GenerationFailed(format!("Failed to tokenize prompt: {:#}", e)))?;
    if tokens.is_empty() {
        return Err(LlmError::GenerationFailed("Prompt produced no tokens".to_string()));
    }

    let prompt_len = tokens.len() as u32;
    let n_ctx = context.n_ctx();
    if prompt_len >= n_ctx {
        return Err(LlmError::GenerationFailed(format!(
            "Prompt of {} tokens does not fit the context window of {}",
            prompt_len, n_ctx
        )));
    }
    // The last sampled token is never decoded, so it needs no slot.
    let budget = budget.min(n_ctx - prompt_len + 1);

    context.clear();
    context
        .decode(&DecodeBatch::prefill(&tokens))
        .map_err(|e| LlmError::GenerationFailed(format!("Prompt decode failed: {:#}", e)))?;

    let mut sampler = SamplingPipeline::from_request(request);
    for &token in &tokens {
        sampler.accept(token);
    }

    let eos = model.eos_token();
    let mut utf8 = Utf8Assembler::default();
    let mut stops = StopScanner::new(request.stop.as_deref());
    let mut text = String::new();
    let mut logits_index = tokens.len() - 1;
    let mut pos = prompt_len;
    let mut completion_tokens = 0u32;
    let mut finish_reason = FinishReason::Length;
    let mut stopped = false;

    while completion_tokens < budget {
        let logits = context.logits_ith(logits_index).ok_or_else(|| {
            LlmError::GenerationFailed(format!("No logits for batch index {}", logits_index))
        })?;
        let token = sampler
            .sample(logits)
            .ok_or_else(|| LlmError::GenerationFailed("Empty logits vector".to_string()))?;
        sampler.accept(token);

        if token == eos {
            finish_reason = FinishReason::Stop;
            break;
        }
        completion_tokens += 1;

        let piece = model
            .token_to_piece(token)
            .map_err(|e| LlmError::GenerationFailed(format!("Failed to detokenize {}: {:#}", token, e)))?;
        let fragment = utf8.push(&piece);
        match stops.push(&fragment) {
            Scan::Emit(ready) => deliver(&mut text, &mut on_chunk, &ready),
            Scan::Stop(ready) => {
                deliver(&mut text, &mut on_chunk, &ready);
                finish_reason = FinishReason::Stop;
                stopped = true;
                break;
            }
        }
        perf_trace!("token {} at pos {}", token, pos);

        if completion_tokens == budget {
            break;
        }
        context
            .decode(&DecodeBatch::single(token, pos))
            .map_err(|e| LlmError::GenerationFailed(format!("Decode failed at pos {}: {:#}", pos, e)))?;
        pos += 1;
        logits_index = 0;
    }

    if !stopped {
        let tail = utf8.finish();
        let ready = match stops.push(&tail) {
            Scan::Emit(ready) => ready + &stops.finish(),
            Scan::Stop(ready) => {
                finish_reason = FinishReason::Stop;
                ready
            }
        };
        deliver(&mut text, &mut on_chunk, &ready);
    }

    log::debug!(
        "Generated {} tokens from a {} token prompt ({:?})",
        completion_tokens,
        prompt_len,
        finish_reason
    );

    Ok(GenerationOutcome {
        text,
        prompt_tokens: prompt_len,
        completion_tokens,
        finish_reason,
    })
}
