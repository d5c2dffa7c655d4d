//! Contract between the scheduler and a streaming vision-language model.

use std::sync::Arc;

use thiserror::Error;
use video_ingest::Frame;

/// Token id produced by the engine's sampler.
pub type Token = u32;

/// Returned from the per-token callback to steer generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerateControl {
    Continue,
    Stop,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("failed to prepare model input: {0}")]
    Prepare(String),
    #[error("generation failed: {0}")]
    Generate(String),
}

/// A model that turns a prompt and an image into streamed text.
///
/// Implementations are shared between the scheduler's worker threads, but the
/// scheduler guarantees that only one task drives `prepare_input`/`generate` at
/// a time.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Model-specific input (tokenised prompt, pixel tensor, ...).
    type Input: Send;

    /// Load weights and warm up. Called at most once successfully.
    fn ensure_loaded(&self) -> Result<(), EngineError>;

    fn prepare_input(&self, prompt: &str, frame: &Frame) -> Result<Self::Input, EngineError>;

    /// Run generation, invoking `on_token` after every decoding step with all
    /// tokens produced so far. A step may add more than one token.
    ///
    /// Returning [`GenerateControl::Stop`] ends generation early; the text
    /// generated up to that point is still returned.
    fn generate(
        &self,
        input: Self::Input,
        max_tokens: usize,
        on_token: &mut dyn FnMut(&[Token]) -> GenerateControl,
    ) -> Result<String, EngineError>;

    /// Decode a token prefix into display text.
    fn decode(&self, tokens: &[Token]) -> String;
}

impl<E: InferenceEngine> InferenceEngine for Arc<E> {
    type Input = E::Input;

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        (**self).ensure_loaded()
    }

    fn prepare_input(&self, prompt: &str, frame: &Frame) -> Result<Self::Input, EngineError> {
        (**self).prepare_input(prompt, frame)
    }

    fn generate(
        &self,
        input: Self::Input,
        max_tokens: usize,
        on_token: &mut dyn FnMut(&[Token]) -> GenerateControl,
    ) -> Result<String, EngineError> {
        (**self).generate(input, max_tokens, on_token)
    }

    fn decode(&self, tokens: &[Token]) -> String {
        (**self).decode(tokens)
    }
}
