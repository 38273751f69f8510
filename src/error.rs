//! Error taxonomy surfaced by the generation pipeline.
//!
//! Every stage boundary reports failures as a single [`ErrorRecord`]; the orchestrator
//! never needs to inspect anything beyond the [`ErrorClass`] to choose a user message.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, ErrorRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Source texture could not be located. Non-fatal for auto-load.
    NotFound,
    /// Unreadable or corrupt image data, or a malformed response payload.
    Decode,
    HttpUnauthorized,
    HttpBadRequest,
    HttpRateLimited,
    HttpQuotaExceeded,
    /// Any other non-2xx status.
    Http,
    /// Connection refused, DNS failure, timeout.
    Network,
    /// The service answered 2xx but reported `success: false`.
    Application,
    /// Another invocation already targets the same material.
    Busy,
    Cancelled,
    Unexpected,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not-found",
            ErrorClass::Decode => "decode",
            ErrorClass::HttpUnauthorized => "http-unauthorized",
            ErrorClass::HttpBadRequest => "http-bad-request",
            ErrorClass::HttpRateLimited => "http-rate-limited",
            ErrorClass::HttpQuotaExceeded => "http-quota-exceeded",
            ErrorClass::Http => "http",
            ErrorClass::Network => "network",
            ErrorClass::Application => "application",
            ErrorClass::Busy => "busy",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Unexpected => "unexpected",
        }
    }

    /// Map a non-2xx HTTP status onto its class. The body never influences this.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorClass::HttpBadRequest,
            401 => ErrorClass::HttpUnauthorized,
            402 => ErrorClass::HttpQuotaExceeded,
            429 => ErrorClass::HttpRateLimited,
            _ => ErrorClass::Http,
        }
    }

    pub fn remediation_hint(self) -> &'static str {
        match self {
            ErrorClass::NotFound => {
                "Select a base texture file, or assign a material with an image texture to the object."
            }
            ErrorClass::Decode => "Make sure the image is a valid PNG, JPEG, BMP or TIFF file.",
            ErrorClass::HttpUnauthorized => "Check your API key in the add-on preferences.",
            ErrorClass::HttpBadRequest => {
                "Check the selected image and that at least one map type is enabled."
            }
            ErrorClass::HttpRateLimited => "Too many requests; wait a moment and retry.",
            ErrorClass::HttpQuotaExceeded => {
                "Your quota is used up; upgrade your plan or wait for the quota reset."
            }
            ErrorClass::Http => "The service returned an error; try again later.",
            ErrorClass::Network => "Check your internet connection and try again.",
            ErrorClass::Application => "The service could not process this image.",
            ErrorClass::Busy => "A generation for this material is already running.",
            ErrorClass::Cancelled => "Generation was cancelled.",
            ErrorClass::Unexpected => "Unexpected error; see the log for details.",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One terminal failure of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{class} ({code}): {message}")]
pub struct ErrorRecord {
    pub class: ErrorClass,
    /// HTTP status, or 0 when not applicable.
    pub code: u16,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            code: 0,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Decode, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unexpected, message)
    }

    pub fn is_http(&self) -> bool {
        matches!(
            self.class,
            ErrorClass::HttpUnauthorized
                | ErrorClass::HttpBadRequest
                | ErrorClass::HttpRateLimited
                | ErrorClass::HttpQuotaExceeded
                | ErrorClass::Http
        )
    }

    /// Message shown to the user: the failure itself followed by what to do about it.
    pub fn user_message(&self) -> String {
        format!("{} {}", self.message, self.class.remediation_hint())
    }
}

impl From<anyhow::Error> for ErrorRecord {
    fn from(e: anyhow::Error) -> Self {
        ErrorRecord::unexpected(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_table() {
        assert_eq!(ErrorClass::from_status(401), ErrorClass::HttpUnauthorized);
        assert_eq!(ErrorClass::from_status(400), ErrorClass::HttpBadRequest);
        assert_eq!(ErrorClass::from_status(429), ErrorClass::HttpRateLimited);
        assert_eq!(ErrorClass::from_status(402), ErrorClass::HttpQuotaExceeded);
        assert_eq!(ErrorClass::from_status(500), ErrorClass::Http);
        assert_eq!(ErrorClass::from_status(404), ErrorClass::Http);
    }

    #[test]
    fn user_message_appends_hint() {
        let e = ErrorRecord::new(ErrorClass::HttpUnauthorized, "API error: bad key").with_code(401);
        let msg = e.user_message();
        assert!(msg.starts_with("API error: bad key"));
        assert!(msg.contains("API key"));
        assert!(e.is_http());
        assert_eq!(e.to_string(), "http-unauthorized (401): API error: bad key");
    }

    #[test]
    fn class_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorClass::HttpQuotaExceeded).unwrap();
        assert_eq!(json, "\"http-quota-exceeded\"");
    }
}
