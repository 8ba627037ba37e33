//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local
//! operations required to make an attached disk available to Pods:
//!
//! 1. **Stage**: format and mount the disk at a global path.
//! 2. **Publish**: bind-mount the global path into the Pod's container.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: unmount the global path.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume from the staging path.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged global path into the container.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
