use crate::api::Problem;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the client.
///
/// Server-reported problem documents are preserved verbatim in [`Error::Api`]
/// and [`Error::Aborted`] so callers can diagnose failures without capturing
/// wire traffic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory document could not be fetched or parsed.
    #[error("directory unavailable: {0}")]
    Directory(String),

    /// The server returned a status code outside the accepted set for an
    /// operation, or an error response to a signed request.
    #[error("API error: {0}")]
    Api(Problem),

    /// No nonce was available, or bad-nonce retries were exhausted.
    #[error("nonce error: {0}")]
    Nonce(String),

    /// Local challenge pre-verification failed.
    #[error("challenge verification failed: {0}")]
    Verification(String),

    /// An order, authorization or challenge never reached a terminal status
    /// within the attempt budget.
    #[error("polling did not reach a terminal status: {0}")]
    PollTimeout(String),

    /// An order, authorization or challenge reached terminal failure
    /// (`invalid`) before success.
    #[error("item reached terminal failure status: {0}")]
    Aborted(Problem),

    /// A challenge type outside the supported set.
    #[error("unknown challenge type: {0}")]
    UnknownChallengeType(String),

    /// The server response violated the protocol shape, e.g. a missing
    /// `Location` header or an object without a URL.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Key, CSR or certificate handling failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<Problem> for Error {
    fn from(problem: Problem) -> Self {
        Error::Api(problem)
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<pkcs8::Error> for Error {
    fn from(err: pkcs8::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<x509_cert::builder::Error> for Error {
    fn from(err: x509_cert::builder::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}
