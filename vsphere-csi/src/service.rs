//! The vSphere CSI service: backend selection, the service facade handed to
//! the protocol runtime, and the pre-serve validation hook.
//!
//! Startup runs in three steps:
//!
//! 1. [`select_backend`] resolves the configured API identifier against the
//!    [`Api`] registry and records what was configured in a
//!    [`ConfiguredApi`].
//! 2. [`VsphereService`] wraps the selection together with the node identity.
//! 3. The protocol runtime calls [`Service::before_serve`] once, right before
//!    it starts accepting requests.  An unresolved backend fails startup.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::backend::Api;
use crate::config::PluginConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::plugin::StoragePlugin;
use crate::types::*;

/// Name of this CSI plugin.
pub const PLUGIN_NAME: &str = "io.k8s.cloud-provider-vsphere.vsphere";

/// Volume slots available on a node VM's paravirtual SCSI controllers.
const MAX_VOLUMES_PER_NODE: u64 = 59;

/// The API identifier this process was configured with.
///
/// Holds the canonical identifier when the backend resolved, or the raw
/// configured value verbatim when it did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredApi {
    identifier: String,
    resolved: Option<Api>,
}

impl ConfiguredApi {
    /// The identifier as it should appear in diagnostics.
    pub fn as_str(&self) -> &str {
        &self.identifier
    }

    /// The registry entry the identifier matched, if any.
    pub fn resolved(&self) -> Option<Api> {
        self.resolved
    }
}

impl fmt::Display for ConfiguredApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// Outcome of [`select_backend`].
pub struct Selection {
    /// What was configured.
    pub api: ConfiguredApi,
    /// The constructed backend, or `None` when the identifier is unknown.
    pub controller: Option<Arc<dyn CsiController>>,
}

/// Resolve `raw` to a provisioning backend.
///
/// An empty identifier selects [`Api::DEFAULT`].  An unknown identifier is
/// not an error here: it yields no controller and is reported by
/// [`Service::before_serve`].  A known backend that fails to initialize is
/// returned as an error.
pub fn select_backend(raw: &str, config: &PluginConfig) -> Result<Selection, CsiError> {
    let identifier = if raw.is_empty() {
        Api::DEFAULT.canonical()
    } else {
        raw
    };

    match Api::parse(identifier) {
        Some(api) => {
            debug!(%api, configured = identifier, "backend API resolved");
            let controller = api.build(config).map_err(|e| match e {
                CsiError::BackendError(reason) => CsiError::BackendError(format!("{api}: {reason}")),
                other => CsiError::BackendError(format!("{api}: {other}")),
            })?;
            Ok(Selection {
                api: ConfiguredApi {
                    identifier: api.canonical().to_owned(),
                    resolved: Some(api),
                },
                controller: Some(controller),
            })
        }
        None => {
            debug!(configured = identifier, "backend API not recognized");
            Ok(Selection {
                api: ConfiguredApi {
                    identifier: identifier.to_owned(),
                    resolved: None,
                },
                controller: None,
            })
        }
    }
}

/// Capability surface the protocol runtime dispatches onto.
#[async_trait]
pub trait Service: CsiIdentity + CsiNode {
    /// The selected provisioning backend, or `None` if none resolved.
    fn controller(&self) -> Option<Arc<dyn CsiController>>;

    /// Lifecycle hook invoked once after the listener is bound and before
    /// any request is accepted.
    ///
    /// Returning an error must stop the runtime from serving.
    async fn before_serve(
        &self,
        cancel: &CancellationToken,
        plugin: &StoragePlugin,
        listener: &UnixListener,
    ) -> Result<(), CsiError>;
}

/// vSphere CSI service facade.
pub struct VsphereService {
    api: ConfiguredApi,
    node_id: NodeId,
    controller: Option<Arc<dyn CsiController>>,
}

impl VsphereService {
    /// Select the backend named by `config.api` and build the facade.
    pub fn new(config: &PluginConfig) -> Result<Self, CsiError> {
        let selection = select_backend(&config.api, config)?;
        Ok(Self::from_selection(selection, NodeId(config.node_id.clone())))
    }

    /// Build the facade from an existing selection.
    pub fn from_selection(selection: Selection, node_id: NodeId) -> Self {
        Self {
            api: selection.api,
            node_id,
            controller: selection.controller,
        }
    }

    /// The API identifier this service was configured with.
    pub fn api(&self) -> &ConfiguredApi {
        &self.api
    }
}

#[async_trait]
impl Service for VsphereService {
    fn controller(&self) -> Option<Arc<dyn CsiController>> {
        self.controller.clone()
    }

    async fn before_serve(
        &self,
        _cancel: &CancellationToken,
        plugin: &StoragePlugin,
        listener: &UnixListener,
    ) -> Result<(), CsiError> {
        let api = &self.api;
        scopeguard::defer! {
            info!(api = %api, "configured: {}", plugin.name());
        }

        debug!(
            endpoint = ?listener.local_addr().ok(),
            "validating backend before serving",
        );

        if self.controller.is_none() {
            return Err(CsiError::InvalidApi(api.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for VsphereService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for VsphereService {
    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeStageVolume".into()))
    }

    #[instrument(skip_all, fields(volume_id = %volume_id, path = staging_target_path))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeUnstageVolume".into()))
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodePublishVolume".into()))
    }

    #[instrument(skip_all, fields(volume_id = %volume_id, path = target_path))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeUnpublishVolume".into()))
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: MAX_VOLUMES_PER_NODE,
            accessible_topology: None,
        })
    }
}
