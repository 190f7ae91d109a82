use thiserror::Error;

/// BurnerError: classification of everything that can go wrong during a run.
/// Fatal variants terminate the process through the runner's fatal sink, the
/// rest are tallied into the owning job's error aggregate.
#[derive(Clone, Error, Debug, PartialEq)]
pub enum BurnerError {
    #[error("Invalid configuration: {raw_error_message}")]
    Config { raw_error_message: String },

    #[error("Unknown kind `{kind}` in api version `{api_version}`")]
    UnknownKind { api_version: String, kind: String },

    #[error("Template error: {raw_error_message}")]
    Template { raw_error_message: String },

    #[error("Unexpected metrics backend result: {raw_error_message}")]
    BadResult { raw_error_message: String },

    #[error("Forbidden by the API server: {raw_error_message}")]
    Forbidden { raw_error_message: String },

    #[error("Conflict: {raw_error_message}")]
    Conflict { raw_error_message: String },

    #[error("Not found: {raw_error_message}")]
    NotFound { raw_error_message: String },

    #[error("Timed out waiting for readiness, {unmet} resource(s) not ready")]
    WaitTimeout { unmet: usize },

    #[error("Transient API failure: {raw_error_message}")]
    Transient { raw_error_message: String },

    #[error("Critical alert fired: {description}")]
    AlertCritical { description: String },

    #[error("Cancelled")]
    Cancelled,
}

impl BurnerError {
    /// Fatal errors abort the whole run, not just the current invocation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BurnerError::Forbidden { .. } | BurnerError::AlertCritical { .. })
    }

    /// Transient errors are retried with backoff where a deadline allows it.
    pub fn is_transient(&self) -> bool {
        matches!(self, BurnerError::Transient { .. })
    }
}

impl From<kube::Error> for BurnerError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(api_err) => {
                let raw_error_message = api_err.message.clone();
                match api_err.code {
                    403 => BurnerError::Forbidden { raw_error_message },
                    404 => BurnerError::NotFound { raw_error_message },
                    409 => BurnerError::Conflict { raw_error_message },
                    429 => BurnerError::Transient { raw_error_message },
                    code if code >= 500 => BurnerError::Transient { raw_error_message },
                    code => BurnerError::Config {
                        raw_error_message: format!("API rejected the request ({code}): {raw_error_message}"),
                    },
                }
            }
            // transport level failures (connection reset, timeouts, ...)
            other => BurnerError::Transient {
                raw_error_message: other.to_string(),
            },
        }
    }
}
