//! Storage plugin lifecycle.
//!
//! [`StoragePlugin`] owns the CSI endpoint.  It binds the unix socket, runs
//! the service's [`before_serve`](Service::before_serve) hook exactly once,
//! and only then hands the listener to the protocol runtime through the
//! [`Serve`] trait.  Request framing and dispatch live entirely in the
//! runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CsiError;
use crate::service::{PLUGIN_NAME, Service};

/// Protocol runtime that accepts connections on the bound listener and
/// dispatches requests onto the service.
#[async_trait]
pub trait Serve<S: ?Sized>: Send + Sync {
    /// Serve until `cancel` fires or the listener fails.
    async fn serve(
        &self,
        listener: UnixListener,
        service: Arc<S>,
        cancel: CancellationToken,
    ) -> Result<(), CsiError>;
}

/// Handle for one plugin process bound to one endpoint.
#[derive(Debug, Clone)]
pub struct StoragePlugin {
    name: String,
    endpoint: PathBuf,
}

impl StoragePlugin {
    /// Create a handle for the socket at `endpoint`.
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: PLUGIN_NAME.to_owned(),
            endpoint: endpoint.into(),
        }
    }

    /// Plugin name reported in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the CSI socket.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Bind the endpoint, validate `service` and serve it with `runtime`.
    ///
    /// A failing [`Service::before_serve`] is returned without ever calling
    /// the runtime, and the socket is removed again.
    pub async fn run<S, R>(
        &self,
        service: Arc<S>,
        runtime: &R,
        cancel: CancellationToken,
    ) -> Result<(), CsiError>
    where
        S: Service + 'static,
        R: Serve<S> + ?Sized,
    {
        let listener = self.bind().await?;

        if let Err(e) = service.before_serve(&cancel, self, &listener).await {
            error!(error = %e, "startup validation failed, not serving");
            drop(listener);
            self.remove_socket().await;
            return Err(e);
        }

        info!(endpoint = %self.endpoint.display(), "serving CSI requests");
        let result = runtime.serve(listener, service, cancel).await;
        self.remove_socket().await;
        result
    }

    async fn bind(&self) -> Result<UnixListener, CsiError> {
        match tokio::fs::remove_file(&self.endpoint).await {
            Ok(()) => debug!(endpoint = %self.endpoint.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::TransportError(format!(
                    "remove stale socket {}: {e}",
                    self.endpoint.display()
                )));
            }
        }

        if let Some(parent) = self.endpoint.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CsiError::TransportError(format!("create dir {}: {e}", parent.display()))
            })?;
        }

        let listener = UnixListener::bind(&self.endpoint).map_err(|e| {
            CsiError::TransportError(format!("bind {}: {e}", self.endpoint.display()))
        })?;
        debug!(endpoint = %self.endpoint.display(), "CSI endpoint bound");
        Ok(listener)
    }

    async fn remove_socket(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.endpoint).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(endpoint = %self.endpoint.display(), error = %e, "failed to remove socket");
        }
    }
}
