//! CSI Controller service trait.
//!
//! The Controller service is the provisioning capability of a backend:
//! creation, deletion, attachment to and detachment from nodes, capability
//! validation, listing, and capacity queries.  Exactly one implementation is
//! selected at process start and exposed through
//! [`Service::controller`](crate::service::Service::controller).

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerPublishVolumeRequest, CreateVolumeRequest, NodeId, PublishContext, Volume,
    VolumeCapability, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node.
    ///
    /// Idempotent for a volume already attached to the same node.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError>;

    /// Detach a volume from a node.
    ///
    /// Idempotent: detaching a volume that is not attached succeeds.
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;
}
