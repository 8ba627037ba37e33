//! Error type shared by the service facade, the backends and the plugin
//! lifecycle.
//!
//! Startup failures surface as [`CsiError::InvalidApi`] (no backend matched
//! the configured identifier) or [`CsiError::BackendError`] (a matched
//! backend failed to initialize).  The remaining variants are per-request
//! outcomes a protocol runtime maps onto CSI status codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    // ----- Startup ---------------------------------------------------------
    /// The configured API identifier did not resolve to any backend.
    ///
    /// Carries the identifier verbatim.
    #[error("invalid API: {0}")]
    InvalidApi(String),

    /// A backend failed to initialize or returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The CSI endpoint could not be prepared or bound.
    #[error("transport error: {0}")]
    TransportError(String),

    // ----- Requests --------------------------------------------------------
    /// A volume with the same name but a different size already exists.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The volume is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Not enough capacity left to satisfy the request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation is not implemented by this plugin.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}
