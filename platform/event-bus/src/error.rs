//! Library-facing error taxonomy and the classifier that assigns an
//! arbitrary failure to one of its variants.
//!
//! Classification order follows the house rule: identity check on
//! well-known types first, case-folded substring matching on the
//! rendered message only as a last resort (see [`classify_by_message`]).

use once_cell::sync::Lazy;
use regex::Regex;

/// The seven-way (plus config/validation) failure classification used
/// by the publisher, the consumer state machine, and the metrics tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Connection,
    Channel,
    Timeout,
    Encoding,
    Config,
    Handler,
    Inbox,
    Storage,
    Validation,
    Unknown,
}

impl ErrorClass {
    /// The metric tag value for this class (see spec §4.6's `error_type` tag).
    pub fn tag(self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::Channel => "channel",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Encoding => "encoding",
            ErrorClass::Config => "config",
            ErrorClass::Handler => "handler",
            ErrorClass::Inbox => "inbox",
            ErrorClass::Storage => "storage",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Errors surfaced by this crate's public operations.
///
/// Every variant wraps a human-readable cause; callers that need the
/// class for retry/dead-letter decisions should call [`MessagingError::class`]
/// rather than matching on the variant directly, since the classifier can
/// reclassify a generic cause (e.g. an I/O error wrapped in `Connection`)
/// more precisely than the constructor site usually knows.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("inbox error: {0}")]
    Inbox(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MessagingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MessagingError::Config(_) => ErrorClass::Config,
            MessagingError::Validation(_) => ErrorClass::Validation,
            MessagingError::Connection(_) => ErrorClass::Connection,
            MessagingError::Channel(_) => ErrorClass::Channel,
            MessagingError::Timeout(_) => ErrorClass::Timeout,
            MessagingError::Encoding(_) => ErrorClass::Encoding,
            MessagingError::Storage(_) => ErrorClass::Storage,
            MessagingError::Handler(_) => ErrorClass::Handler,
            MessagingError::Inbox(_) => ErrorClass::Inbox,
            MessagingError::Unknown(_) => ErrorClass::Unknown,
        }
    }

    pub(crate) fn from_class(class: ErrorClass, message: String) -> Self {
        match class {
            ErrorClass::Connection => MessagingError::Connection(message),
            ErrorClass::Channel => MessagingError::Channel(message),
            ErrorClass::Timeout => MessagingError::Timeout(message),
            ErrorClass::Encoding => MessagingError::Encoding(message),
            ErrorClass::Config => MessagingError::Config(message),
            ErrorClass::Handler => MessagingError::Handler(message),
            ErrorClass::Inbox => MessagingError::Inbox(message),
            ErrorClass::Storage => MessagingError::Storage(message),
            ErrorClass::Validation => MessagingError::Validation(message),
            ErrorClass::Unknown => MessagingError::Unknown(message),
        }
    }

    /// Build a `MessagingError` directly from a `lapin` failure, classifying
    /// it along the way.
    pub fn from_lapin(err: lapin::Error) -> Self {
        let class = classify_lapin_error(&err);
        Self::from_class(class, err.to_string())
    }

    /// Build a `MessagingError` from a JSON decode/encode failure. JSON
    /// failures are always `Encoding` — there is no ambiguity to classify.
    pub fn from_json(err: serde_json::Error) -> Self {
        MessagingError::Encoding(err.to_string())
    }
}

/// Direct identity classification of a `lapin::Error`. `lapin::Error` is
/// `#[non_exhaustive]`, so unmatched variants fall through to the
/// message-substring heuristic rather than failing to compile on a new
/// lapin release.
pub fn classify_lapin_error(err: &lapin::Error) -> ErrorClass {
    match err {
        lapin::Error::IOError(_) => ErrorClass::Connection,
        lapin::Error::MissingHeartbeatError => ErrorClass::Connection,
        lapin::Error::InvalidConnectionState(_) => ErrorClass::Connection,
        lapin::Error::ChannelsLimitReached => ErrorClass::Channel,
        lapin::Error::InvalidChannel(_) => ErrorClass::Channel,
        lapin::Error::InvalidChannelState(_) => ErrorClass::Channel,
        lapin::Error::ParsingError(_) => ErrorClass::Encoding,
        lapin::Error::SerialisationError(_) => ErrorClass::Encoding,
        other => classify_by_message(&other.to_string()),
    }
}

/// Last-resort classification: case-folded, word-boundary substring
/// matching on a rendered error message. Used for third-party error types
/// that expose a single opaque variant (e.g. an adapter around a broker
/// client that only gives us a string).
pub fn classify_by_message(message: &str) -> ErrorClass {
    static CONNECTION_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(connection|socket|refused|unreachable)\b").unwrap());
    static CHANNEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bchannel\b").unwrap());
    static TIMEOUT_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(timeout|timed out)\b").unwrap());
    static ENCODING_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(json|encode|decode|utf-?8)\b").unwrap());
    static ROUTING_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(exchange|routing)\b").unwrap());

    if CONNECTION_RE.is_match(message) {
        ErrorClass::Connection
    } else if TIMEOUT_RE.is_match(message) {
        ErrorClass::Timeout
    } else if ENCODING_RE.is_match(message) {
        ErrorClass::Encoding
    } else if CHANNEL_RE.is_match(message) || ROUTING_RE.is_match(message) {
        ErrorClass::Channel
    } else {
        ErrorClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_substrings() {
        assert_eq!(
            classify_by_message("Connection refused by broker"),
            ErrorClass::Connection
        );
        assert_eq!(
            classify_by_message("operation timed out after 5s"),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_by_message("invalid JSON in payload"),
            ErrorClass::Encoding
        );
        assert_eq!(
            classify_by_message("no queue bound to exchange"),
            ErrorClass::Channel
        );
        assert_eq!(
            classify_by_message("the cat sat on the mat"),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn word_boundaries_avoid_false_positives() {
        // "socketed" should not match "socket" as a loose substring would.
        assert_eq!(classify_by_message("socketed pipe fitting"), ErrorClass::Unknown);
    }

    #[test]
    fn error_class_round_trips_through_from_class() {
        let err = MessagingError::from_class(ErrorClass::Storage, "db down".into());
        assert_eq!(err.class(), ErrorClass::Storage);
        assert!(matches!(err, MessagingError::Storage(_)));
    }
}
