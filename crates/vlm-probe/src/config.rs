use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// An error type for the configuration module.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Error to read the configuration file.
    #[error("Failed to read the configuration file {path}")]
    ReadError {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Error to parse the configuration file.
    #[error("Failed to parse the configuration file {path}")]
    ParseError {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying json error.
        source: serde_json::Error,
    },

    /// A configuration value is out of its valid range.
    #[error("Invalid configuration value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Which model to load and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hugging Face hub identifier of the model.
    pub model_id: String,
    /// Hub revision to download.
    pub revision: String,
    /// Optional local safetensors files used instead of the hub weights.
    pub weights: Option<Vec<PathBuf>>,
    /// Optional local `tokenizer.json` used instead of the hub tokenizer.
    pub tokenizer: Option<PathBuf>,
    /// Optional chat template overriding the backend default.
    pub chat_template: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "google/paligemma-3b-mix-224".to_string(),
            revision: "main".to_string(),
            weights: None,
            tokenizer: None,
            chat_template: None,
        }
    }
}

/// Sampling parameters of the generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub seed: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: usize,
    pub do_sample: bool,
    /// A value of `1.0` disables the penalty.
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Keep the post-hook logits of every step in the output.
    pub output_scores: bool,
    /// Keep the image attention of every step in the output, if the backend supports it.
    pub output_attentions: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: 299792458,
            temperature: 0.7,
            top_p: 0.9,
            max_new_tokens: 200,
            do_sample: true,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            output_scores: true,
            output_attentions: true,
        }
    }
}

/// Configuration of the uncertainty estimator and the built-in analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Number of candidates captured per generation step.
    pub top_k: usize,
    /// Candidates below this probability are ignored by the analysis.
    pub min_token_prob: f32,
    /// Drop the leading vision CLS position of every attention vector that carries one.
    pub use_cls_token: bool,
    /// Number of steps listed as most uncertain in the insight summary.
    pub most_uncertain: usize,
    /// Insight service model written as `provider:model`, `None` disables the service.
    pub insight_model: Option<String>,
    /// Name of the environment variable holding the insight service API key.
    pub insight_api_key_env: String,
    /// Overrides the base url derived from the provider.
    pub insight_base_url: Option<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            top_k: 100,
            min_token_prob: 0.01,
            use_cls_token: true,
            most_uncertain: 5,
            insight_model: Some("together:meta-llama/Llama-Vision-Free".to_string()),
            insight_api_key_env: "TOGETHER_API_KEY".to_string(),
            insight_base_url: None,
        }
    }
}

/// A single image/question pair and where its artifacts go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub image_path: PathBuf,
    pub question: String,
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("images/one_dot.png"),
            question: "What do you see?".to_string(),
            output_dir: PathBuf::from("results/one_dot"),
        }
    }
}

/// Full configuration of an experiment.
///
/// Every run shares the same model, sampling and analyzer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
    pub analyzer: AnalyzerConfig,
    pub runs: Vec<RunConfig>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            sampling: SamplingConfig::default(),
            analyzer: AnalyzerConfig::default(),
            runs: vec![RunConfig::default()],
        }
    }
}

impl ExperimentConfig {
    /// Read and validate a JSON configuration file.
    ///
    /// Missing fields take their default value.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&data).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is in its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::InvalidValue {
            field,
            reason: reason.to_string(),
        };

        let sampling = &self.sampling;
        if !(sampling.temperature > 0.0) {
            return Err(invalid("sampling.temperature", "must be strictly positive"));
        }
        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            return Err(invalid("sampling.top_p", "must be in (0, 1]"));
        }
        if sampling.max_new_tokens == 0 {
            return Err(invalid("sampling.max_new_tokens", "must be at least 1"));
        }
        if self.analyzer.top_k == 0 {
            return Err(invalid("analyzer.top_k", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.analyzer.min_token_prob) {
            return Err(invalid("analyzer.min_token_prob", "must be in [0, 1)"));
        }
        if self.runs.is_empty() {
            return Err(invalid("runs", "at least one run is required"));
        }
        Ok(())
    }
}
