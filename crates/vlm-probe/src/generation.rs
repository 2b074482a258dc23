use image::RgbImage;

use crate::config::SamplingConfig;

/// Error raised by an inference backend.
///
/// Wraps the backend specific error so any model implementation can be plugged in.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct ModelError(Box<dyn std::error::Error + Send + Sync>);

impl ModelError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// A function invoked at each generation step before sampling.
///
/// It receives the token sequence generated so far (prompt included) and may observe or
/// modify the candidate logits in place.
pub trait LogitsHook {
    fn on_step(&mut self, step: usize, input_ids: &[u32], logits: &mut [f32]);
}

/// Turns token ids back into text.
pub trait TokenDecoder {
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, ModelError>;

    /// The text of a single token, special tokens included.
    fn token_text(&self, token: u32) -> Result<String, ModelError> {
        self.decode(&[token], false)
    }
}

/// A vision-language model able to answer a prompt about an image.
pub trait VisionLanguageModel: TokenDecoder {
    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// The chat template used to render conversations for this model.
    fn chat_template(&self) -> &str;

    /// Run the sampled generation, calling `hook` once per generated token.
    fn generate(
        &mut self,
        request: &GenerationRequest<'_>,
        hook: &mut dyn LogitsHook,
    ) -> Result<GenerationOutput, ModelError>;
}

/// Everything the backend needs for one generation.
pub struct GenerationRequest<'a> {
    /// The rendered chat prompt.
    pub prompt: &'a str,
    pub image: &'a RgbImage,
    pub sampling: &'a SamplingConfig,
}

/// The result of a generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    /// Prompt tokens followed by the generated continuation.
    pub sequences: Vec<u32>,
    /// Number of prompt tokens at the start of `sequences`.
    pub prompt_len: usize,
    /// Post-hook logits of every step, empty unless requested.
    pub scores: Vec<Vec<f32>>,
    /// Attention of every generated token over the image positions, empty unless requested
    /// and supported by the backend.
    pub attentions: Vec<Vec<f32>>,
    /// `(rows, cols)` of the image patch grid the attentions refer to.
    pub image_grid: Option<(usize, usize)>,
}

impl GenerationOutput {
    /// The tokens strictly after the prompt.
    pub fn generated_tokens(&self) -> &[u32] {
        self.sequences.get(self.prompt_len..).unwrap_or(&[])
    }

    /// Decode the generated continuation, never including prompt tokens.
    pub fn decode_generated(&self, decoder: &dyn TokenDecoder) -> Result<String, ModelError> {
        decoder.decode(self.generated_tokens(), true)
    }
}
