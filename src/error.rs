use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of errors that can cross the channel boundary. Anything raised inside a
///  remote handler is mapped onto one of these kinds so callers can branch on the kind rather
///  than on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    /// cancellation requested by local code - not a failure
    #[error("aborted: {message}")]
    Abort { message: String },
    #[error("missing resource: {message}")]
    MissingResource { message: String },
    #[error("unexpected response ({status}): {message}")]
    UnexpectedResponse { message: String, status: u16 },
    #[error("password error ({code:?}): {message}")]
    Password { message: String, code: PasswordCode },
    #[error("invalid document: {message}")]
    InvalidDocument { message: String },
    #[error("unknown remote error: {message} ({details})")]
    UnknownRemote { message: String, details: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordCode {
    NeedPassword = 1,
    IncorrectPassword = 2,
}

impl DocError {
    pub fn abort(message: impl Into<String>) -> DocError {
        DocError::Abort { message: message.into() }
    }

    pub fn unknown(message: impl Into<String>, details: impl Into<String>) -> DocError {
        DocError::UnknownRemote { message: message.into(), details: details.into() }
    }

    pub fn invalid_document(message: impl Into<String>) -> DocError {
        DocError::InvalidDocument { message: message.into() }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, DocError::Abort { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DocError::Abort { .. } => ErrorRecord::KIND_ABORT,
            DocError::MissingResource { .. } => ErrorRecord::KIND_MISSING_RESOURCE,
            DocError::UnexpectedResponse { .. } => ErrorRecord::KIND_UNEXPECTED_RESPONSE,
            DocError::Password { .. } => ErrorRecord::KIND_PASSWORD,
            DocError::InvalidDocument { .. } => ErrorRecord::KIND_INVALID_DOCUMENT,
            DocError::UnknownRemote { .. } => ErrorRecord::KIND_UNKNOWN_REMOTE,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DocError::Abort { message }
            | DocError::MissingResource { message }
            | DocError::UnexpectedResponse { message, .. }
            | DocError::Password { message, .. }
            | DocError::InvalidDocument { message }
            | DocError::UnknownRemote { message, .. } => message,
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        let mut record = ErrorRecord {
            kind: self.kind().to_string(),
            message: self.message().to_string(),
            status: None,
            code: None,
            details: None,
        };
        match self {
            DocError::UnexpectedResponse { status, .. } => record.status = Some(*status),
            DocError::Password { code, .. } => record.code = Some(*code as u8),
            DocError::UnknownRemote { details, .. } => record.details = Some(details.clone()),
            _ => {}
        }
        record
    }

    /// Re-hydrates an error that crossed the channel. Records of a kind this side does not
    ///  know (e.g. a newer peer) become [DocError::UnknownRemote] carrying the original kind.
    pub fn from_record(record: ErrorRecord) -> DocError {
        let ErrorRecord { kind, message, status, code, details } = record;
        match kind.as_str() {
            ErrorRecord::KIND_ABORT => DocError::Abort { message },
            ErrorRecord::KIND_MISSING_RESOURCE => DocError::MissingResource { message },
            ErrorRecord::KIND_UNEXPECTED_RESPONSE => DocError::UnexpectedResponse { message, status: status.unwrap_or(0) },
            ErrorRecord::KIND_PASSWORD => {
                let code = match code {
                    Some(2) => PasswordCode::IncorrectPassword,
                    _ => PasswordCode::NeedPassword,
                };
                DocError::Password { message, code }
            }
            ErrorRecord::KIND_INVALID_DOCUMENT => DocError::InvalidDocument { message },
            ErrorRecord::KIND_UNKNOWN_REMOTE => DocError::UnknownRemote { message, details: details.unwrap_or_default() },
            other => DocError::UnknownRemote { message, details: format!("unknown error kind {:?}", other) },
        }
    }
}

/// Flat representation of a [DocError] for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<u8>,
    pub details: Option<String>,
}

impl ErrorRecord {
    pub const KIND_ABORT: &'static str = "AbortError";
    pub const KIND_MISSING_RESOURCE: &'static str = "MissingResourceError";
    pub const KIND_UNEXPECTED_RESPONSE: &'static str = "UnexpectedResponseError";
    pub const KIND_PASSWORD: &'static str = "PasswordError";
    pub const KIND_INVALID_DOCUMENT: &'static str = "InvalidDocumentError";
    pub const KIND_UNKNOWN_REMOTE: &'static str = "UnknownRemoteError";
}

impl From<DocError> for ErrorRecord {
    fn from(value: DocError) -> Self {
        value.to_record()
    }
}

impl From<ErrorRecord> for DocError {
    fn from(value: ErrorRecord) -> Self {
        DocError::from_record(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::abort(DocError::abort("stop"))]
    #[case::missing(DocError::MissingResource { message: "gone".to_string() })]
    #[case::unexpected(DocError::UnexpectedResponse { message: "teapot".to_string(), status: 418 })]
    #[case::need_password(DocError::Password { message: "pw".to_string(), code: PasswordCode::NeedPassword })]
    #[case::incorrect_password(DocError::Password { message: "pw".to_string(), code: PasswordCode::IncorrectPassword })]
    #[case::invalid(DocError::invalid_document("bad header"))]
    #[case::unknown(DocError::unknown("boom", "stack"))]
    fn test_record_preserves_kind(#[case] error: DocError) {
        let record = error.to_record();
        assert_eq!(record.kind, error.kind());
        assert_eq!(DocError::from_record(record), error);
    }

    #[test]
    fn test_unknown_kind_becomes_unknown_remote() {
        let record = ErrorRecord {
            kind: "TypeError".to_string(),
            message: "x is undefined".to_string(),
            status: None,
            code: None,
            details: None,
        };
        match DocError::from_record(record) {
            DocError::UnknownRemote { message, details } => {
                assert_eq!(message, "x is undefined");
                assert!(details.contains("TypeError"));
            }
            other => panic!("expected UnknownRemote, was {:?}", other),
        }
    }
}
