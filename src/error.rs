//! Error types for the optreq crate.
//!
//! This module defines the [`Error`] enum, a unified error type used throughout the client.
//! All errors produced by this crate will be returned as a variant of [`Error`],
//! making error handling simple and consistent.

use std::fmt;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

/// A unified error type for all operations in this crate.
///
/// Most methods return a [`Result<T, Error>`]. This enum wraps errors from
/// underlying libraries and provides additional variants for deadline expiry
/// and HTTP status-based errors.
#[derive(Debug, Error)]
#[error(transparent)]
pub enum Error {
    /// A parse error from the `url` crate while building the base request.
    UrlParseError(#[from] url::ParseError),
    /// An error recorded by a request option while the request was assembled.
    #[error("Builder error: {0}")]
    BuilderError(#[from] BuilderError),
    /// An error from the `http` crate.
    HttpError(#[from] http::Error),
    /// An error from the `hyper` crate.
    HyperError(#[from] hyper::Error),
    /// An error from deserializing a JSON response body.
    #[error("Error decoding response body.")]
    Decode(#[from] serde_json::Error),
    /// An error from the legacy hyper client utility.
    ClientError(#[from] hyper_util::client::legacy::Error),
    /// The deadline elapsed before the call completed.
    #[error("operation timed out")]
    Timeout,
    /// Draining the response body failed after the response line arrived.
    #[error("read body error: {source}")]
    ReadError {
        /// Status code of the response whose body could not be drained.
        code: StatusCode,
        /// The underlying failure.
        source: Box<Error>,
    },
    /// Returned when the server responds with an unexpected status code.
    StatusError(#[from] StatusError),
}

impl Error {
    /// Returns true if the error was recorded by a request option during assembly.
    pub fn is_builder(&self) -> bool {
        matches!(self, Self::BuilderError(..))
    }

    /// Returns true if the error came from the status-check policy or from
    /// `Response::error_for_status`.
    pub fn is_status(&self) -> bool {
        matches!(self, Self::StatusError { .. })
    }

    /// Returns true if the error is related to connect
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::ClientError(err) if err.is_connect())
    }

    /// Returns true if the error was caused by the call deadline, including a
    /// deadline that expired while the response body was being drained.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::ReadError { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::StatusError(err) => Some(err.code()),
            Self::ReadError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// An error produced by a request option while assembling a request.
///
/// Any option failure aborts the call before network I/O happens, so a
/// request carrying a [`BuilderError`] is never sent.
#[derive(Debug, Error)]
#[error(transparent)]
pub enum BuilderError {
    /// An error from the `http` crate.
    Http(#[from] http::Error),
    /// An invalid header value was supplied.
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// An error from serializing URL query or form parameters.
    SerializeUrl(#[from] serde_urlencoded::ser::Error),
    /// An error from serializing a JSON body.
    SerializeJson(#[from] serde_json::Error),
    /// A non-replayable body was attached more than once.
    #[error("streaming body already consumed")]
    BodyConsumed,
}

/// The status-check policy rejected a response.
///
/// Raised by the byte-buffering call paths when status checking is enabled
/// and the response code is not 200, and by `Response::error_for_status`.
/// The response body drained before the error was raised travels with it.
#[derive(Debug)]
pub struct StatusError {
    code: StatusCode,
    body: Bytes,
}

impl StatusError {
    pub(crate) fn new(code: StatusCode, body: Bytes) -> Self {
        Self { code, body }
    }

    /// The HTTP status code of the response.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The drained response body.
    ///
    /// Empty when the error was raised before the body was read, as
    /// `Response::error_for_status` does.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http status code: {}", self.code.as_u16())
    }
}

impl std::error::Error for StatusError {}

/// A result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
