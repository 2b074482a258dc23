use std::io::Cursor;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, RgbImage};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;

use crate::config::AnalyzerConfig;

/// An error type for the insight module.
#[derive(thiserror::Error, Debug)]
pub enum InsightError {
    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    ImageEncodingError(#[from] image::ImageError),

    #[error("Insight service returned status {status}: {body}")]
    ServiceError { status: u16, body: String },

    #[error("Insight service returned no message content")]
    MissingContent,

    #[error("Invalid insight model `{0}`, expected `provider:model`")]
    InvalidModel(String),

    #[error("Unknown insight provider `{0}`, set `insight_base_url` to use it")]
    UnknownProvider(String),
}

const SYSTEM_PROMPT: &str = "You are an expert in evaluating the uncertainty of vision-language models. \
You receive a question about an image, the model answer and per-token uncertainty statistics. \
Reply with a single JSON object and nothing else.";

/// What the insight service is asked about.
pub struct InsightRequest<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    /// Local uncertainty summary sent along with the question.
    pub summary: &'a serde_json::Value,
    pub image: Option<&'a RgbImage>,
}

/// An external service turning the uncertainty summary into a structured insight.
pub trait InsightService {
    fn request_insight(&self, request: &InsightRequest<'_>)
        -> Result<serde_json::Value, InsightError>;
}

/// An insight model written as `provider:model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightModel {
    pub provider: String,
    pub model: String,
}

impl FromStr for InsightModel {
    type Err = InsightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_lowercase(),
                model: model.to_string(),
            }),
            _ => Err(InsightError::InvalidModel(s.to_string())),
        }
    }
}

impl InsightModel {
    /// Base url of the OpenAI compatible api of the known providers.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "together" => Some("https://api.together.xyz/v1"),
            "openai" => Some("https://api.openai.com/v1"),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client of an OpenAI compatible `chat/completions` endpoint.
pub struct ChatCompletionsClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, InsightError> {
        Ok(Self {
            http: reqwest::blocking::Client::builder().build()?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Build the client described by the analyzer configuration.
    ///
    /// Returns `None` when no insight model is configured or when the API key variable is not
    /// set; the key itself is only ever read from the environment.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Option<Self>, InsightError> {
        let Some(model_name) = config.insight_model.as_deref() else {
            return Ok(None);
        };
        let model: InsightModel = model_name.parse()?;
        let base_url = match config.insight_base_url.as_deref() {
            Some(url) => url.to_string(),
            None => model
                .default_base_url()
                .ok_or_else(|| InsightError::UnknownProvider(model.provider.clone()))?
                .to_string(),
        };

        let api_key = match std::env::var(&config.insight_api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                warn!(
                    "{} is not set, the overall insight will not be requested from {model_name}",
                    config.insight_api_key_env
                );
                return Ok(None);
            }
        };

        Ok(Some(Self::new(&base_url, model.model, api_key)?))
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl InsightService for ChatCompletionsClient {
    fn request_insight(
        &self,
        request: &InsightRequest<'_>,
    ) -> Result<serde_json::Value, InsightError> {
        let mut content = vec![json!({
            "type": "text",
            "text": build_insight_prompt(request.question, request.answer, request.summary),
        })];
        if let Some(image) = request.image {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": png_data_url(image)? },
            }));
        }

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": content },
            ],
            "temperature": 0.2,
            "max_tokens": 1024,
        });

        debug!("requesting insight from {} ({})", self.endpoint, self.model);
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(InsightError::ServiceError {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let completion: ChatCompletionResponse = response.json()?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(InsightError::MissingContent)?;

        Ok(parse_insight_content(&content))
    }
}

/// The user message sent to the insight service.
pub fn build_insight_prompt(question: &str, answer: &str, summary: &serde_json::Value) -> String {
    let summary = serde_json::to_string_pretty(summary).unwrap_or_else(|_| summary.to_string());
    format!(
        "Question: {question}\n\
         Model answer: {answer}\n\
         Token uncertainty summary:\n{summary}\n\n\
         Analyze how uncertain the model is and how well the answer is grounded in the image. \
         Respond with a JSON object with the keys \"scores\" (\"overall_uncertainty\", \
         \"visual_grounding\" and \"confidence\", each between 0 and 1), \
         \"uncertainty_analysis\" (\"high_uncertainty_parts\", \"main_issues\", \
         \"key_suggestions\") and \"visual_analysis\" (\"visual_grounding\", \"focus_areas\")."
    )
}

/// Parse the service answer as JSON, tolerating markdown code fences.
///
/// Answers that are not JSON are kept verbatim under `"raw"`.
pub fn parse_insight_content(content: &str) -> serde_json::Value {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(unfenced).unwrap_or_else(|_| json!({ "raw": content }))
}

fn png_data_url(image: &RgbImage) -> Result<String, InsightError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buf.into_inner())
    ))
}
