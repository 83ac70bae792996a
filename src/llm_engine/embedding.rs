//! Embedding extraction from the resident model

use super::lifecycle::ResidentModel;
use super::provider::{EmbeddingInput, EmbeddingResponse, LlmError};
use super::runtime::DecodeBatch;

/// Embed `input` with the resident model, which must be `model_name`.
/// Batch inputs are joined and produce one vector.
pub(crate) fn embed(
    resident: Option<&mut ResidentModel>,
    model_name: &str,
    input: &EmbeddingInput,
) -> Result<EmbeddingResponse, LlmError> {
    let resident = match resident {
        Some(resident) if resident.name() == model_name => resident,
        _ => return Err(LlmError::ModelNotLoaded(model_name.to_string())),
    };
    let (model, context) = resident.parts();

    let text = input.joined();
    let tokens = model
        .tokenize(&text, true)
        .map_err(|e| LlmError::GenerationFailed(format!("Failed to tokenize input: {:#}", e)))?;
    if tokens.is_empty() {
        return Err(LlmError::GenerationFailed("Input produced no tokens".to_string()));
    }
    if tokens.len() as u32 > context.n_ctx() {
        return Err(LlmError::GenerationFailed(format!(
            "Input of {} tokens does not fit the context window of {}",
            tokens.len(),
            context.n_ctx()
        )));
    }

    context.clear();
    context
        .decode(&DecodeBatch::prefill(&tokens))
        .map_err(|e| LlmError::GenerationFailed(format!("Embedding decode failed: {:#}", e)))?;

    let n_embd = model.n_embd();
    let vector = context
        .embeddings()
        .ok_or_else(|| LlmError::GenerationFailed(format!("{} produced no embedding", model_name)))?;
    if vector.len() < n_embd {
        return Err(LlmError::GenerationFailed(format!(
            "Embedding has {} values, expected {}",
            vector.len(),
            n_embd
        )));
    }

    perf_debug!("Embedded {} tokens into {} dims", tokens.len(), n_embd);
    Ok(EmbeddingResponse {
        model: model_name.to_string(),
        embedding: vector[..n_embd].to_vec(),
        prompt_tokens: tokens.len() as u32,
    })
}
