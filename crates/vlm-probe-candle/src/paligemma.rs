use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::paligemma::{Config, Model};
use hf_hub::{api::sync::Api, Repo, RepoType};
use image::{imageops::FilterType, RgbImage};
use log::{debug, info, warn};
use tokenizers::Tokenizer;
use vlm_probe::config::ModelConfig;
use vlm_probe::generation::{
    GenerationOutput, GenerationRequest, LogitsHook, ModelError, TokenDecoder,
    VisionLanguageModel,
};

use crate::hub::hub_load_safetensors;

/// Side of the square input image of the 224 checkpoints.
const IMAGE_SIZE: u32 = 224;

/// Side of the SigLIP patch grid for a 224x224 input.
const PATCH_GRID: usize = 16;

/// PaliGemma mix checkpoints take a task prefix before the user text and a trailing newline.
/// The image tokens are prepended by the model itself.
///
/// Questions that already carry a task prefix (`caption en`, `detect dot`, ...) are passed
/// through unchanged.
pub const PALIGEMMA_TEMPLATE: &str = "{% for message in messages %}{% if message['role'] == 'user' %}{% for line in message['content'] %}{% if line['type'] == 'text' %}{% set text = line['text'] %}{% if not (text is startingwith('answer ') or text is startingwith('caption ') or text is startingwith('describe ') or text is startingwith('detect ') or text is startingwith('segment ') or text is startingwith('ocr') or text is startingwith('question ')) %}answer en {% endif %}{{ text }}{% endif %}{% endfor %}{% endif %}{% endfor %}{% if add_generation_prompt %}\n{% endif %}";

/// An error type for the candle backend.
#[derive(thiserror::Error, Debug)]
pub enum CandleVlmError {
    /// Error to download from the hub.
    #[error(transparent)]
    FailedToLoadModel(#[from] hf_hub::api::sync::ApiError),

    /// Error raised by candle.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Error raised by the tokenizer.
    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    /// Error to read a local file.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The sharded weights index cannot be used.
    #[error("Invalid safetensors index: {0}")]
    InvalidWeightIndex(String),

    /// The tokenizer has no end of sequence token.
    #[error("Cannot find the <eos> token")]
    EosTokenNotFound,
}

impl From<CandleVlmError> for ModelError {
    fn from(err: CandleVlmError) -> Self {
        ModelError::new(err)
    }
}

/// The Google PaliGemma model running on candle.
///
/// NOTE: to run the model with Cuda, build with the `cuda` feature.
pub struct PaligemmaBackend {
    model: Model,
    tokenizer: Tokenizer,
    model_id: String,
    eos_token: u32,
    device: Device,
    dtype: DType,
}

impl PaligemmaBackend {
    /// Load the weights and the tokenizer, from the local files of the configuration when set
    /// and from the hub otherwise.
    pub fn load(config: &ModelConfig) -> Result<Self, CandleVlmError> {
        #[cfg(feature = "cuda")]
        let (device, dtype) = match Device::cuda_if_available(0) {
            Ok(device) if device.is_cuda() => (device, DType::BF16),
            Ok(device) => {
                warn!("CUDA not available, defaulting to CPU");
                (device, DType::F32)
            }
            Err(e) => {
                warn!("CUDA not available, defaulting to CPU: {e}");
                (Device::Cpu, DType::F32)
            }
        };

        #[cfg(not(feature = "cuda"))]
        let (device, dtype) = (Device::Cpu, DType::F32);

        let (weights, tokenizer_file) = match (&config.weights, &config.tokenizer) {
            (Some(weights), Some(tokenizer)) => (weights.clone(), tokenizer.clone()),
            (weights, tokenizer) => {
                let api = Api::new()?;
                let repo = api.repo(Repo::with_revision(
                    config.model_id.clone(),
                    RepoType::Model,
                    config.revision.clone(),
                ));
                let weights = match weights {
                    Some(weights) => weights.clone(),
                    None => hub_load_safetensors(&repo, "model.safetensors.index.json")?,
                };
                let tokenizer = match tokenizer {
                    Some(tokenizer) => tokenizer.clone(),
                    None => repo.get("tokenizer.json")?,
                };
                (weights, tokenizer)
            }
        };
        info!(
            "loading {} from {} weight files on {device:?} ({dtype:?})",
            config.model_id,
            weights.len()
        );

        let tokenizer = Tokenizer::from_file(tokenizer_file)?;
        let eos_token = tokenizer
            .token_to_id("<eos>")
            .ok_or(CandleVlmError::EosTokenNotFound)?;

        let model_config = Config::paligemma_3b_224();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
        let model = Model::new(&model_config, vb)?;

        Ok(Self {
            model,
            tokenizer,
            model_id: config.model_id.clone(),
            eos_token,
            device,
            dtype,
        })
    }

    /// The device the model runs on.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    // resize to 224x224 and scale to [-1, 1] with shape [1, 3, 224, 224]
    fn image_tensor(&self, image: &RgbImage) -> Result<Tensor, CandleVlmError> {
        let resized = image::imageops::resize(image, IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);
        let size = IMAGE_SIZE as usize;
        let image_t = Tensor::from_vec(resized.into_raw(), (size, size, 3), &self.device)?
            .to_dtype(self.dtype)?
            .permute((2, 0, 1))?
            .affine(2. / 255., -1.)?
            .unsqueeze(0)?;
        Ok(image_t)
    }

    fn run(
        &mut self,
        request: &GenerationRequest<'_>,
        hook: &mut dyn LogitsHook,
    ) -> Result<GenerationOutput, CandleVlmError> {
        let sampling = request.sampling;
        let image = self.image_tensor(request.image)?;

        let mut tokens = self
            .tokenizer
            .encode(request.prompt, true)?
            .get_ids()
            .to_vec();
        let prompt_len = tokens.len();

        let mut logits_processor = if sampling.do_sample {
            LogitsProcessor::new(
                sampling.seed,
                Some(sampling.temperature),
                Some(sampling.top_p),
            )
        } else {
            LogitsProcessor::from_sampling(sampling.seed, Sampling::ArgMax)
        };

        if sampling.output_attentions {
            warn!("the candle PaliGemma model does not expose its attention weights");
        }

        self.model.clear_kv_cache();
        let mut scores = Vec::new();
        let start_gen = std::time::Instant::now();
        for index in 0..sampling.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                self.model.forward(&input)?
            } else {
                self.model.setup(&image, &input)?
            };
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if sampling.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(sampling.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    sampling.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let mut values = logits.to_vec1::<f32>()?;
            hook.on_step(index, &tokens, &mut values);
            if sampling.output_scores {
                scores.push(values.clone());
            }
            let vocab_size = values.len();
            let logits = Tensor::from_vec(values, vocab_size, &self.device)?;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if next_token == self.eos_token {
                break;
            }
        }

        let generated = tokens.len() - prompt_len;
        debug!(
            "{generated} tokens generated ({:.2} token/s)",
            generated as f64 / start_gen.elapsed().as_secs_f64()
        );

        Ok(GenerationOutput {
            sequences: tokens,
            prompt_len,
            scores,
            attentions: Vec::new(),
            image_grid: Some((PATCH_GRID, PATCH_GRID)),
        })
    }
}

impl TokenDecoder for PaligemmaBackend {
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, ModelError> {
        Ok(self
            .tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(CandleVlmError::from)?)
    }

    fn token_text(&self, token: u32) -> Result<String, ModelError> {
        // decoding a lone token drops its leading space
        match self.tokenizer.id_to_token(token) {
            Some(piece) => Ok(piece.replace('\u{2581}', " ")),
            None => self.decode(&[token], false),
        }
    }
}

impl VisionLanguageModel for PaligemmaBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn chat_template(&self) -> &str {
        PALIGEMMA_TEMPLATE
    }

    fn generate(
        &mut self,
        request: &GenerationRequest<'_>,
        hook: &mut dyn LogitsHook,
    ) -> Result<GenerationOutput, ModelError> {
        Ok(self.run(request, hook)?)
    }
}
