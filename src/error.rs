//! The error types shared across the coordination core.
//!
//! Every fallible operation in `vcs`, `store`, `scanner`, `materializer`,
//! `branch_ops`, and `pty` eventually resolves into a [`CoreError`], which the
//! request surface maps onto an HTTP status and a `{error, code?}` JSON body.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// The top-level error kind, mirroring §7 of the specification.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input, failed validation, or a rejected precondition (dirty
    /// tree, branch already exists, not checked out, ...).
    #[error("{0}")]
    BadRequest(String),

    /// A request body failed declarative schema validation, §4.9/spec.md:167
    /// ("validation failure is a 400 with a field-keyed error"). Keyed by
    /// field path (e.g. `branchName`, or `_body` when no single field can be
    /// blamed, such as malformed JSON).
    #[error("validation failed")]
    Validation { fields: BTreeMap<String, String> },

    /// An entity looked up by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A subprocess (git or the hosting CLI) exited non-zero for reasons that
    /// look like internal breakage rather than user intent.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        CoreError::BadRequest(message.into())
    }

    pub fn validation(fields: BTreeMap<String, String>) -> Self {
        CoreError::Validation { fields }
    }

    /// A single-field validation error, the common case (one bad parameter).
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), message.into());
        CoreError::Validation { fields }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CoreError::NotFound(message.into())
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        CoreError::Internal(message.to_string())
    }

    /// The status code the request surface should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::BadRequest(_) => 400,
            CoreError::Validation { .. } => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Internal(_) => 500,
        }
    }

    /// A short machine-readable code, when one applies.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            CoreError::BadRequest(_) => Some("bad_request"),
            CoreError::Validation { .. } => Some("validation_error"),
            CoreError::NotFound(_) => Some("not_found"),
            CoreError::Internal(_) => None,
        }
    }

    pub fn to_response_body(&self) -> ErrorBody {
        match self {
            CoreError::Validation { fields } => ErrorBody {
                error: self.to_string(),
                code: self.code(),
                fields: Some(fields.clone()),
            },
            _ => ErrorBody {
                error: self.to_string(),
                code: self.code(),
                fields: None,
            },
        }
    }
}

/// Wire format for error responses: `{error, code?, fields?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}

/// Builds a field-keyed [`CoreError::Validation`] from a `serde_json`
/// deserialization failure. `serde_json::Error`'s `Display` names the
/// offending field for the common cases (`missing field` / `unknown field`);
/// when no single field can be blamed (malformed JSON, a type mismatch deep
/// in a nested value) the whole message is keyed under `_body`.
pub fn validation_from_serde_json(err: &serde_json::Error) -> CoreError {
    let message = err.to_string();
    let field = extract_field_name(&message);
    let mut fields = BTreeMap::new();
    fields.insert(field.unwrap_or_else(|| "_body".to_string()), message);
    CoreError::Validation { fields }
}

/// Pulls the backtick-quoted identifier out of messages like `missing field
/// \`branchName\`` or `unknown field \`foo\`, expected one of ...`.
fn extract_field_name(message: &str) -> Option<String> {
    let needle = "field `";
    let start = message.find(needle)? + needle.len();
    let rest = &message[start..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

/// Converts a subprocess failure into the right `CoreError` variant.
///
/// Non-zero exits whose stderr looks like ordinary git refusal (conflicts,
/// "already exists", dirty tree, diverged history) are user-facing
/// `BadRequest`s; anything else is treated as `Internal` since the cause is
/// unknown, per §7's SubprocessFailure policy.
pub fn subprocess_failure(operation: &str, stderr: &str) -> CoreError {
    let looks_like_user_error = stderr.contains("conflict")
        || stderr.contains("already exists")
        || stderr.contains("not something we can merge")
        || stderr.contains("have diverged")
        || stderr.contains("would be overwritten")
        || stderr.contains("uncommitted changes")
        || stderr.contains("did not match any")
        || stderr.contains("refusing to fetch")
        // Network timeout on pull/push/fetch, §7's "Transient" category — reported
        // as BadRequest with the original message rather than Internal.
        || stderr.contains("timed out after");

    let message = if stderr.trim().is_empty() {
        format!("{operation} failed")
    } else {
        format!("{operation} failed: {}", stderr.trim())
    };

    if looks_like_user_error {
        CoreError::BadRequest(message)
    } else {
        CoreError::Internal(message)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(format!("{err:?}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprocess_failure_classifies_known_user_errors_as_bad_request() {
        assert!(matches!(
            subprocess_failure("git rebase", "CONFLICT (content): merge conflict in foo.rs"),
            CoreError::BadRequest(_)
        ));
        assert!(matches!(
            subprocess_failure("git branch", "fatal: a branch named 'x' already exists"),
            CoreError::BadRequest(_)
        ));
    }

    #[test]
    fn subprocess_failure_classifies_timeout_as_bad_request() {
        assert!(matches!(
            subprocess_failure("git fetch origin", "timed out after 60s"),
            CoreError::BadRequest(_)
        ));
    }

    #[test]
    fn subprocess_failure_classifies_unknown_stderr_as_internal() {
        assert!(matches!(
            subprocess_failure("git status", "fatal: not a git repository"),
            CoreError::Internal(_)
        ));
    }

    #[test]
    fn validation_from_missing_field_is_keyed_by_field_name() {
        #[derive(serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            branch_name: String,
        }
        let err = serde_json::from_str::<Body>("{}").unwrap_err();
        let core_err = validation_from_serde_json(&err);
        let CoreError::Validation { fields } = core_err else {
            panic!("expected Validation variant");
        };
        assert!(fields.contains_key("branch_name"));
    }

    #[test]
    fn validation_from_malformed_json_falls_back_to_body_key() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let core_err = validation_from_serde_json(&err);
        let CoreError::Validation { fields } = core_err else {
            panic!("expected Validation variant");
        };
        assert!(fields.contains_key("_body"));
    }

    #[test]
    fn validation_error_body_serializes_fields() {
        let err = CoreError::invalid_field("branchName", "must match ^[A-Za-z0-9/_-]+$");
        let body = err.to_response_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["fields"]["branchName"], "must match ^[A-Za-z0-9/_-]+$");
        assert_eq!(json["code"], "validation_error");
    }
}
