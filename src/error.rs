//! Typed error kinds per the error-handling design (§7): configuration
//! failures abort startup, everything else is caught at the narrowest
//! scope and folded into a structured result rather than propagated.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or invalid rule/playbook/chain-rule/legend table at load.
    /// Fatal: the caller should abort startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Chain strategy invoked with no seed value, an unknown chain type,
    /// or an unresolvable action. Never raised across an API boundary —
    /// converted into a `{status: "failed", error}` envelope by the
    /// caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// CC Index, WARC fetch, or ES query failure. Caught at the
    /// narrowest scope (per domain, per record, per rule call); logged,
    /// the surrounding aggregator continues.
    #[error("transient error: {0}")]
    Transient(String),

    /// All rule ids in a fallback chain failed.
    #[error("no working rule for type: {0}")]
    FallbackExhausted(String),

    /// The external WARC fetcher exited non-zero. Partial output already
    /// consumed is kept; this only carries the diagnostic.
    #[error("external binary failure: {0}")]
    ExternalBinary(String),

    /// Entity-store persistence failed. Never retried inside the core.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Errors specific to the CC Index client. `Transient` is retried with
/// backoff before being surfaced; `Fatal` indicates a malformed request
/// and is not retried.
#[derive(Debug, Error)]
pub enum CCIndexError {
    #[error("cc index transient failure: {0}")]
    Transient(String),
    #[error("cc index fatal failure: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
