//! Validation of caller input.
//!
//! Every public engine operation validates its arguments here before
//! touching storage, so storage code can assume well-formed data.

use crate::types::{Category, Scope};

/// Longest accepted tag or custom category label.
const MAX_LABEL_LEN: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Validation Error
// ─────────────────────────────────────────────────────────────────────────────

/// Specific validation error types for engine input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Fact text is empty or whitespace.
    #[error("fact text is empty")]
    EmptyText,

    /// Fact text exceeds the configured maximum.
    #[error("fact text is {actual} characters; the limit is {max}")]
    TextTooLong { max: usize, actual: usize },

    /// Fact text contains a NUL byte.
    #[error("fact text contains a NUL byte")]
    NulByte,

    /// Embedding dimension mismatch.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding contains invalid values (NaN or Inf).
    #[error("embedding contains {count} invalid values (NaN or Inf)")]
    InvalidEmbeddingValues { count: usize },

    /// A `0.0..=1.0` quantity is out of range.
    #[error("{field} {value} is out of range [0.0, 1.0]")]
    OutOfRange { field: &'static str, value: f32 },

    /// A non-global scope without a target.
    #[error("scope '{0}' requires a non-empty target")]
    EmptyScopeTarget(String),

    /// Tag or category label is malformed.
    #[error("{field} '{value}' must be 1-64 characters of a-z, 0-9, '-', '_', ':' or '.'")]
    BadLabel { field: &'static str, value: String },

    /// Enumerated value not recognised.
    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },

    /// Supersession target is no longer current.
    #[error("fact {id} is already superseded by {by}")]
    AlreadySuperseded { id: String, by: String },

    /// A link from a fact to itself.
    #[error("a fact cannot link to itself")]
    SelfLink,

    /// Search query has no searchable terms.
    #[error("search query has no searchable terms")]
    EmptyQuery,

    /// Traversal depth beyond the configured cap.
    #[error("traversal depth {requested} exceeds the cap of {max}")]
    DepthTooLarge { requested: usize, max: usize },

    /// Limit of zero.
    #[error("limit must be at least 1")]
    ZeroLimit,
}

type ValidationResult = std::result::Result<(), ValidationError>;

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate an embedding vector.
///
/// Checks:
/// 1. Dimension matches expected size
/// 2. No NaN or Inf values
pub fn validate_embedding(embedding: &[f32], expected_dim: usize) -> ValidationResult {
    if embedding.len() != expected_dim {
        return Err(ValidationError::DimensionMismatch {
            expected: expected_dim,
            actual: embedding.len(),
        });
    }

    let invalid_count = embedding.iter().filter(|v| !v.is_finite()).count();
    if invalid_count > 0 {
        return Err(ValidationError::InvalidEmbeddingValues {
            count: invalid_count,
        });
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Fact Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate fact text against the configured maximum length (in chars).
pub fn validate_text(text: &str, max_len: usize) -> ValidationResult {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText);
    }
    if text.contains('\0') {
        return Err(ValidationError::NulByte);
    }
    let len = text.chars().count();
    if len > max_len {
        return Err(ValidationError::TextTooLong {
            max: max_len,
            actual: len,
        });
    }
    Ok(())
}

/// Validate a `0.0..=1.0` score such as importance, confidence or strength.
pub fn validate_unit(field: &'static str, value: f32) -> ValidationResult {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(())
}

pub fn validate_scope(scope: &Scope) -> ValidationResult {
    match scope.target() {
        Some(t) if t.trim().is_empty() => {
            Err(ValidationError::EmptyScopeTarget(scope.kind().to_string()))
        }
        _ => Ok(()),
    }
}

pub fn validate_category(category: &Category) -> ValidationResult {
    if let Category::Custom(label) = category {
        validate_label("category", label)?;
    }
    Ok(())
}

pub fn validate_tags(tags: &[String]) -> ValidationResult {
    for tag in tags {
        validate_label("tag", tag)?;
    }
    Ok(())
}

fn validate_label(field: &'static str, value: &str) -> ValidationResult {
    let ok = !value.is_empty()
        && value.len() <= MAX_LABEL_LEN
        && value.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | ':' | '.')
        });
    if ok {
        Ok(())
    } else {
        Err(ValidationError::BadLabel {
            field,
            value: value.to_string(),
        })
    }
}

pub fn validate_depth(requested: usize, max: usize) -> ValidationResult {
    if requested > max {
        return Err(ValidationError::DepthTooLarge { requested, max });
    }
    Ok(())
}

pub fn validate_limit(limit: usize) -> ValidationResult {
    if limit == 0 {
        return Err(ValidationError::ZeroLimit);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_embedding_valid() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3, 0.4], 4).is_ok());
    }

    #[test]
    fn test_validate_embedding_dimension_mismatch() {
        let err = validate_embedding(&[0.1, 0.2], 4).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_validate_embedding_nan_and_inf() {
        let err = validate_embedding(&[0.1, f32::NAN, f32::INFINITY, 0.4], 4).unwrap_err();
        assert_eq!(err, ValidationError::InvalidEmbeddingValues { count: 2 });
    }

    #[test]
    fn test_validate_text() {
        assert!(validate_text("User prefers dark mode", 100).is_ok());
        assert_eq!(validate_text("   ", 100), Err(ValidationError::EmptyText));
        assert_eq!(validate_text("a\0b", 100), Err(ValidationError::NulByte));
        assert!(matches!(
            validate_text("abcdef", 5),
            Err(ValidationError::TextTooLong { max: 5, actual: 6 })
        ));
        // Counted in characters, not bytes
        assert!(validate_text("ééééé", 5).is_ok());
    }

    #[test]
    fn test_validate_unit() {
        assert!(validate_unit("importance", 0.0).is_ok());
        assert!(validate_unit("importance", 1.0).is_ok());
        assert!(validate_unit("importance", 1.01).is_err());
        assert!(validate_unit("strength", -0.1).is_err());
        assert!(validate_unit("strength", f32::NAN).is_err());
    }

    #[test]
    fn test_validate_scope() {
        assert!(validate_scope(&Scope::Global).is_ok());
        assert!(validate_scope(&Scope::User("alice".into())).is_ok());
        assert!(validate_scope(&Scope::Session("  ".into())).is_err());
    }

    #[test]
    fn test_validate_tags() {
        assert!(validate_tags(&["ui".into(), "team:core".into(), "v1.2".into()]).is_ok());
        assert!(validate_tags(&["Has Caps".into()]).is_err());
        assert!(validate_tags(&["".into()]).is_err());
        assert!(validate_tags(&["x".repeat(65)]).is_err());
    }

    #[test]
    fn test_validate_depth_and_limit() {
        assert!(validate_depth(3, 3).is_ok());
        assert!(validate_depth(4, 3).is_err());
        assert!(validate_limit(1).is_ok());
        assert_eq!(validate_limit(0), Err(ValidationError::ZeroLimit));
    }
}
