//! Core CSI types: volumes, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, the service
//! facade and backend implementations.  They are all
//! [`Serialize`]/[`Deserialize`] so a protocol runtime can marshal them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a Kubernetes node (the VM name in vSphere).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type formatted onto the disk.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "ext4".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (e.g. datacenter affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Topology segments, e.g. `{"datacenter": "dc-1"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Opaque key-value pairs returned by `ControllerPublishVolume` and passed
/// on to the node stage/publish calls.
pub type PublishContext = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Human-readable name for the volume.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded to the backend.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    /// Volume to attach.
    pub volume_id: VolumeId,
    /// Node the volume is attached to.
    pub node_id: NodeId,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the attachment should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: PublishContext,
}

/// Request to publish (bind-mount) a staged volume into a Pod container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path inside the container.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"io.k8s.cloud-provider-vsphere.vsphere"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
