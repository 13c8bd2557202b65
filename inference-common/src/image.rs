//! Image generation types and parameter limits.

use serde::{Deserialize, Serialize};

use crate::validation::{check_prompt, check_range, check_text, ValidationError};

pub const MIN_DIMENSION: u32 = 128;
pub const MAX_DIMENSION: u32 = 2048;
/// Latent space downsamples by 8, so pixel sizes must divide evenly.
pub const DIMENSION_MULTIPLE: u32 = 8;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 100;
pub const MIN_CFG_SCALE: f32 = 1.0;
pub const MAX_CFG_SCALE: f32 = 30.0;
pub const MAX_PROMPT_CHARS: usize = 1000;
/// Seed value that asks the runtime to pick one.
pub const RANDOM_SEED: i64 = -1;

/// Sampling method used by the diffusion backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    #[default]
    EulerA,
    Euler,
    Heun,
    Dpm2,
    #[serde(rename = "dpm++2m")]
    DpmPlusPlus2m,
    Lcm,
}

/// Encoded image container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    /// Sniff the container from its magic bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else {
            None
        }
    }
}

/// Text-to-image generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    /// `-1` picks a random seed at generation time.
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default)]
    pub sampler: Sampler,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: default_negative_prompt(),
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            seed: default_seed(),
            sampler: Sampler::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cfg_scale(mut self, cfg_scale: f32) -> Self {
        self.cfg_scale = cfg_scale;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// True when the runtime must choose the seed.
    pub fn wants_random_seed(&self) -> bool {
        self.seed == RANDOM_SEED
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_prompt("prompt", &self.prompt, Some(MAX_PROMPT_CHARS))?;
        check_text("negative_prompt", &self.negative_prompt, Some(MAX_PROMPT_CHARS))?;
        check_dimension("width", self.width)?;
        check_dimension("height", self.height)?;
        check_range("steps", self.steps, MIN_STEPS, MAX_STEPS)?;
        check_range("cfg_scale", self.cfg_scale, MIN_CFG_SCALE, MAX_CFG_SCALE)?;
        if self.seed < RANDOM_SEED {
            return Err(ValidationError::OutOfRange {
                field: "seed",
                value: self.seed as f64,
                min: RANDOM_SEED as f64,
                max: i64::MAX as f64,
            });
        }
        Ok(())
    }
}

fn check_dimension(field: &'static str, value: u32) -> Result<(), ValidationError> {
    check_range(field, value, MIN_DIMENSION, MAX_DIMENSION)?;
    if value % DIMENSION_MULTIPLE != 0 {
        return Err(ValidationError::NotMultipleOf {
            field,
            value,
            multiple: DIMENSION_MULTIPLE,
        });
    }
    Ok(())
}

/// A generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub image_data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// The seed actually used, never `-1`.
    pub seed: i64,
    pub steps: u32,
    pub duration_ms: u64,
}

// Default values
fn default_negative_prompt() -> String {
    "ugly, blurry, low quality, deformed".to_string()
}
fn default_dimension() -> u32 {
    512
}
fn default_steps() -> u32 {
    20
}
fn default_cfg_scale() -> f32 {
    7.5
}
fn default_seed() -> i64 {
    RANDOM_SEED
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request() -> ImageRequest {
        ImageRequest::new("a watercolor fox")
    }

    #[test]
    fn test_defaults_are_valid() {
        let request = request();
        assert_eq!(request.width, 512);
        assert_eq!(request.height, 512);
        assert_eq!(request.steps, 20);
        assert_eq!(request.cfg_scale, 7.5);
        assert!(request.wants_random_seed());
        assert!(request.validate().is_ok());
    }

    #[rstest]
    #[case(512, 512, 25, 7.5, true)]
    #[case(128, 128, 1, 1.0, true)]
    #[case(2048, 2048, 100, 30.0, true)]
    #[case(100, 512, 25, 7.5, false)]
    #[case(513, 512, 25, 7.5, false)]
    #[case(512, 2056, 25, 7.5, false)]
    #[case(512, 512, 0, 7.5, false)]
    #[case(512, 512, 101, 7.5, false)]
    #[case(512, 512, 25, 31.0, false)]
    #[case(512, 512, 25, 0.5, false)]
    fn test_validation_boundaries(
        #[case] width: u32,
        #[case] height: u32,
        #[case] steps: u32,
        #[case] cfg_scale: f32,
        #[case] valid: bool,
    ) {
        let request = request()
            .with_size(width, height)
            .with_steps(steps)
            .with_cfg_scale(cfg_scale);
        assert_eq!(request.validate().is_ok(), valid, "{:?}", request);
    }

    #[test]
    fn test_width_not_multiple_of_eight() {
        match request().with_size(513, 512).validate() {
            Err(ValidationError::NotMultipleOf { field, value, .. }) => {
                assert_eq!(field, "width");
                assert_eq!(value, 513);
            }
            other => panic!("Expected NotMultipleOf error, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_length_limit() {
        let mut request = request();
        request.prompt = "a".repeat(MAX_PROMPT_CHARS);
        assert!(request.validate().is_ok());
        request.prompt.push('a');
        assert!(matches!(
            request.validate(),
            Err(ValidationError::TooLong { field: "prompt", .. })
        ));
    }

    #[test]
    fn test_negative_prompt_may_be_empty() {
        let mut request = request();
        request.negative_prompt.clear();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_seed_below_random_marker_rejected() {
        assert!(request().with_seed(-2).validate().is_err());
        assert!(request().with_seed(42).validate().is_ok());
    }

    #[test]
    fn test_sampler_serialization() {
        let json = serde_json::to_string(&Sampler::DpmPlusPlus2m).unwrap();
        assert_eq!(json, "\"dpm++2m\"");
        let request: ImageRequest =
            serde_json::from_str(r#"{"prompt": "x", "sampler": "euler"}"#).unwrap();
        assert_eq!(request.sampler, Sampler::Euler);
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::detect(b"GIF89a"), None);
    }
}
