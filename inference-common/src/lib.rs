//! Local Inference Common Types
//!
//! Request and response types shared by the inference runtime and the
//! dispatchers that feed it. Validation here is pure: no I/O, no mutation.

pub mod image;
pub mod text;
pub mod validation;

pub use image::{ImageFormat, ImageRequest, ImageResponse, Sampler};
pub use text::{StopReason, TextRequest, TextResponse, VisionRequest};
pub use validation::ValidationError;
