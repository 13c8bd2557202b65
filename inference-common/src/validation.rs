//! Validation errors and shared field checks.

/// A request field that failed validation.
///
/// Every variant maps to an `InvalidRequest` at the runtime boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is too long: {len} characters (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains a NUL character")]
    NulCharacter { field: &'static str },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must be a multiple of {multiple}, got {value}")]
    NotMultipleOf {
        field: &'static str,
        value: u32,
        multiple: u32,
    },

    #[error("invalid or unsupported image: {0}")]
    InvalidImage(String),
}

/// Check a prompt-like field: non-blank, no NUL, and within `max_chars` if set.
///
/// Length is counted in characters, not bytes.
pub fn check_prompt(
    field: &'static str,
    value: &str,
    max_chars: Option<usize>,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    check_text(field, value, max_chars)
}

/// Like [`check_prompt`] but allows an empty value.
pub fn check_text(
    field: &'static str,
    value: &str,
    max_chars: Option<usize>,
) -> Result<(), ValidationError> {
    if value.contains('\0') {
        return Err(ValidationError::NulCharacter { field });
    }
    if let Some(max) = max_chars {
        let len = value.chars().count();
        if len > max {
            return Err(ValidationError::TooLong { field, len, max });
        }
    }
    Ok(())
}

/// Inclusive range check for numeric parameters.
pub fn check_range<T>(field: &'static str, value: T, min: T, max: T) -> Result<(), ValidationError>
where
    T: PartialOrd + Into<f64> + Copy,
{
    // NaN fails both comparisons, so test containment rather than exclusion.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        })
    }
}
