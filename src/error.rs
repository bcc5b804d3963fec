//! Structured error taxonomy shared across the rules engine, game service,
//! matchmaker, and API layer. Each variant maps to one HTTP status and a
//! stable `code` the client can branch on.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Machine-readable error codes surfaced in the JSON error envelope.
/// Only a subset of variants carry one; the rest are adequately described
/// by their HTTP status plus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    EmailNotVerified,
    OfferLimitReached,
    OfferAlreadyPending,
    NotYourOffer,
    NoOfferPending,
    ClaimNotAvailable,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            ErrorCode::OfferLimitReached => "OFFER_LIMIT_REACHED",
            ErrorCode::OfferAlreadyPending => "OFFER_ALREADY_PENDING",
            ErrorCode::NotYourOffer => "NOT_YOUR_OFFER",
            ErrorCode::NoOfferPending => "NO_OFFER_PENDING",
            ErrorCode::ClaimNotAvailable => "CLAIM_NOT_AVAILABLE",
        }
    }
}

/// The crate-wide error type. Every fallible core operation returns
/// `Result<T, CoreError>`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input, illegal move, wrong turn, invalid promotion, etc. 4xx,
    /// never logged as severe.
    #[error("{0}")]
    Validation(String),

    /// CAS failure on move commit, offer already pending, claim not
    /// currently valid. 409 — the client is expected to re-read and retry.
    #[error("{0}")]
    Conflict(String),

    /// Missing/invalid token, revoked token, locked account, or identity
    /// mismatch with the bound player slot. 401/403, generic message.
    #[error("{0}")]
    Authorization(String),

    /// Operating on a game that is not in the required status. 400.
    #[error("{0}")]
    Lifecycle(String),

    /// Referenced entity does not exist. 404.
    #[error("{0}")]
    NotFound(String),

    /// Persistence or remote-bus hiccup; safe to retry or skip a tick.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Startup misconfiguration or unrecoverable persistence failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        CoreError::Authorization(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        CoreError::Lifecycle(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        CoreError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CoreError::Fatal(msg.into())
    }

    /// Attaches a machine-readable code to a validation/authorization error.
    pub fn with_code(self, code: ErrorCode) -> CodedCoreError {
        CodedCoreError { inner: self, code: Some(code) }
    }
}

/// Wraps a `CoreError` with an optional stable `code` for the JSON envelope.
#[derive(Debug, Error)]
#[error("{inner}")]
pub struct CodedCoreError {
    inner: CoreError,
    code: Option<ErrorCode>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) | CoreError::Lifecycle(_) => StatusCode::BAD_REQUEST,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Authorization(_) => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, CoreError::Authorization(_)) {
            log::warn!("authorization failure: {self}");
        } else if matches!(self, CoreError::Fatal(_)) {
            log::error!("fatal error: {self}");
        }
        HttpResponse::build(self.status_code()).json(ErrorBody { error: self.to_string(), code: None })
    }
}

impl ResponseError for CodedCoreError {
    fn status_code(&self) -> StatusCode {
        self.inner.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(ErrorBody { error: self.inner.to_string(), code: self.code.map(ErrorCode::as_str) })
    }
}

impl From<CoreError> for CodedCoreError {
    fn from(inner: CoreError) -> Self {
        CodedCoreError { inner, code: None }
    }
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        CoreError::Transient(format!("storage error: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Fatal(format!("serialization error: {e}"))
    }
}
