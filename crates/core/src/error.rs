use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Code verification failed: {0}")]
    CodeVerification(String),

    #[error("Login attempt not found or expired: {0}")]
    AttemptExpired(String),

    #[error("Decryption failed")]
    Decryption,

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code, used by the control surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "authentication_failure",
            Error::CodeVerification(_) => "code_verification_failure",
            Error::AttemptExpired(_) => "attempt_expired",
            Error::Decryption => "decryption_failure",
            Error::Automation(_) => "automation_error",
            Error::Classifier(_) => "classifier_error",
            Error::NotConnected(_) => "not_connected",
            Error::Config(_) => "config_error",
            Error::Io(_) | Error::Json(_) | Error::Storage(_) | Error::Other(_) => "internal_error",
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
        }
    }

    /// Human-readable summary that is safe to hand to an operator.
    ///
    /// Domain variants carry messages written by this crate and are passed
    /// through. Low-level I/O, JSON and storage failures are collapsed into a
    /// generic sentence; the detail only goes to the log.
    pub fn user_message(&self) -> String {
        match self {
            Error::Io(_) | Error::Json(_) | Error::Storage(_) | Error::Other(_) => {
                "Internal error, see server log for details".to_string()
            }
            Error::Decryption => {
                "Stored session could not be decrypted; log in again".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
