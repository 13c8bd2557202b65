//! Text and vision inference types.

use serde::{Deserialize, Serialize};

use crate::image::ImageFormat;
use crate::validation::{check_prompt, check_range, ValidationError};

/// Upper bound for `max_tokens`, matching the largest context we size for.
pub const MAX_TOKENS_LIMIT: u32 = 8192;

/// Text completion request for a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// Sequences that end generation early.
    #[serde(default)]
    pub stop: Vec<String>,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
            stop: Vec::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_prompt("prompt", &self.prompt, None)?;
        check_range("max_tokens", self.max_tokens, 1, MAX_TOKENS_LIMIT)?;
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        // top_p is a probability mass; zero would leave nothing to sample.
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ValidationError::OutOfRange {
                field: "top_p",
                value: self.top_p.into(),
                min: 0.0,
                max: 1.0,
            });
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(ValidationError::OutOfRange {
                field: "repeat_penalty",
                value: self.repeat_penalty.into(),
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }
}

/// Vision request: a text prompt about an attached image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionRequest {
    pub prompt: String,
    /// Raw PNG or JPEG bytes.
    pub image: Vec<u8>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl VisionRequest {
    pub fn new(prompt: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            prompt: prompt.into(),
            image,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_prompt("prompt", &self.prompt, None)?;
        check_range("max_tokens", self.max_tokens, 1, MAX_TOKENS_LIMIT)?;
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        if self.image.is_empty() {
            return Err(ValidationError::InvalidImage("image data is empty".to_string()));
        }
        if ImageFormat::detect(&self.image).is_none() {
            return Err(ValidationError::InvalidImage(
                "expected PNG or JPEG data".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model emitted an end token or a stop sequence.
    Stop,
    /// `max_tokens` was reached.
    Length,
    /// The backend hit an internal error mid-generation; the text is partial.
    Error,
}

/// Result of a text or vision inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub tokens_generated: u32,
    pub duration_ms: u64,
    pub tokens_per_second: f64,
    pub stop_reason: StopReason,
}

// Default values
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> u32 {
    40
}
fn default_repeat_penalty() -> f32 {
    1.1
}
