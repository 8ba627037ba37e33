//! First Class Disk (FCD) backend.
//!
//! [`FcdController`] implements [`CsiController`] on top of vSphere First
//! Class Disks: named virtual disks that live on a datastore independently
//! of any VM and are attached to node VMs on demand.
//!
//! The controller keeps its disk inventory in concurrent maps so the
//! protocol runtime can dispatch requests from many tasks at once.
//!
//! # Cloud config
//!
//! ```yaml
//! vcenter: vc.example.com
//! datacenter: dc-1
//! datastore: vsanDatastore
//! capacityBytes: 1099511627776
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::PluginConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::types::*;

/// Key stored in [`Volume::parameters`] recording the caller-supplied name.
const PARAM_CSI_NAME: &str = "_csi_name";

/// Publish / volume context key carrying the disk UUID.
pub const CONTEXT_DISK_UUID: &str = "diskUUID";

/// Volume context key carrying the datastore name.
pub const CONTEXT_DATASTORE: &str = "datastore";

/// vCenter connection and placement settings for the FCD backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FcdConfig {
    /// vCenter server host name.
    pub vcenter: String,
    /// Datacenter holding the datastore.
    pub datacenter: String,
    /// Datastore on which disks are placed.
    pub datastore: String,
    /// Capacity of the datastore reserved for CSI volumes.
    pub capacity_bytes: u64,
}

impl Default for FcdConfig {
    fn default() -> Self {
        Self {
            vcenter: String::new(),
            datacenter: "datacenter".to_owned(),
            datastore: "datastore1".to_owned(),
            capacity_bytes: 1 << 40,
        }
    }
}

impl FcdConfig {
    /// Load and validate a cloud-config YAML file.
    pub fn load(path: &Path) -> Result<Self, CsiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CsiError::BackendError(format!("read cloud config {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            CsiError::BackendError(format!("parse cloud config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CsiError> {
        if self.datastore.is_empty() {
            return Err(CsiError::BackendError(
                "cloud config: datastore must not be empty".into(),
            ));
        }
        if self.capacity_bytes == 0 {
            return Err(CsiError::BackendError(
                "cloud config: capacityBytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A provisioned disk and the nodes it is attached to.
#[derive(Debug, Clone)]
struct FcdDisk {
    volume: Volume,
    access_mode: AccessMode,
    attached_to: Vec<NodeId>,
}

/// CSI controller backed by vSphere First Class Disks.
pub struct FcdController {
    config: FcdConfig,
    /// Disks keyed by volume ID.
    disks: DashMap<VolumeId, FcdDisk>,
    /// Maps the caller-supplied volume name to the assigned [`VolumeId`],
    /// making `create_volume` idempotent.
    names: DashMap<String, VolumeId>,
    /// Bytes handed out to disks.  Held for the whole of a create or delete
    /// so name reservation, the capacity check and the inserts are atomic.
    allocated: Mutex<u64>,
}

impl FcdController {
    /// Create a controller for an already validated configuration.
    pub fn new(config: FcdConfig) -> Self {
        Self {
            config,
            disks: DashMap::new(),
            names: DashMap::new(),
            allocated: Mutex::new(0),
        }
    }

    /// Create a controller from the plugin configuration, loading the cloud
    /// config file when one is configured.
    pub fn from_config(config: &PluginConfig) -> Result<Self, CsiError> {
        let fcd = match &config.cloud_config {
            Some(path) => FcdConfig::load(path)?,
            None => FcdConfig::default(),
        };
        info!(
            vcenter = %fcd.vcenter,
            datacenter = %fcd.datacenter,
            datastore = %fcd.datastore,
            "FCD backend initialized",
        );
        Ok(Self::new(fcd))
    }

    /// The configuration this controller was built with.
    pub fn config(&self) -> &FcdConfig {
        &self.config
    }
}

#[async_trait]
impl CsiController for FcdController {
    #[instrument(skip(self), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        if req.capacity_bytes == 0 {
            return Err(CsiError::InvalidArgument(
                "capacity_bytes must be positive".into(),
            ));
        }

        let mut allocated = self.allocated.lock().map_err(CsiError::internal)?;

        let existing_id = self.names.get(&req.name).map(|r| r.clone());
        if let Some(id) = existing_id {
            if let Some(disk) = self.disks.get(&id).map(|r| r.clone()) {
                if disk.volume.capacity_bytes != req.capacity_bytes {
                    return Err(CsiError::VolumeAlreadyExists(req.name));
                }
                debug!(name = %req.name, %id, "returning existing disk for idempotent create");
                return Ok(disk.volume);
            }
            self.names.remove(&req.name);
        }

        let free = self.config.capacity_bytes.saturating_sub(*allocated);
        if req.capacity_bytes > free {
            return Err(CsiError::ResourceExhausted(format!(
                "requested {} bytes, {free} bytes free on {}",
                req.capacity_bytes, self.config.datastore
            )));
        }

        let access_mode = req
            .volume_capabilities
            .first()
            .map(|cap| cap.access_mode)
            .unwrap_or(AccessMode::ReadWriteOnce);

        let disk_uuid = uuid::Uuid::new_v4().to_string();
        let vol_id = VolumeId(format!("fcd-{disk_uuid}"));

        let mut parameters = req.parameters;
        parameters.insert(PARAM_CSI_NAME.to_owned(), req.name.clone());

        // Accessibility constraints are not advertised, so no topology.
        let volume = Volume {
            volume_id: vol_id.clone(),
            capacity_bytes: req.capacity_bytes,
            parameters,
            volume_context: HashMap::from([
                (CONTEXT_DISK_UUID.to_owned(), disk_uuid),
                (CONTEXT_DATASTORE.to_owned(), self.config.datastore.clone()),
            ]),
            accessible_topology: Vec::new(),
        };

        self.disks.insert(
            vol_id.clone(),
            FcdDisk {
                volume: volume.clone(),
                access_mode,
                attached_to: Vec::new(),
            },
        );
        self.names.insert(req.name, vol_id.clone());
        *allocated += req.capacity_bytes;

        info!(%vol_id, datastore = %self.config.datastore, "disk created");
        Ok(volume)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let mut allocated = self.allocated.lock().map_err(CsiError::internal)?;

        // Attachment check and removal share the shard lock.
        let Some((_, disk)) = self
            .disks
            .remove_if(volume_id, |_, disk| disk.attached_to.is_empty())
        else {
            return match self.disks.get(volume_id) {
                Some(disk) => Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is attached to {} node(s)",
                    disk.attached_to.len()
                ))),
                None => {
                    debug!(%volume_id, "disk already gone");
                    Ok(())
                }
            };
        };

        *allocated = allocated.saturating_sub(disk.volume.capacity_bytes);
        if let Some(name) = disk.volume.parameters.get(PARAM_CSI_NAME) {
            self.names.remove_if(name, |_, id| id == volume_id);
        }

        info!(%volume_id, "disk deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        let mut disk = self
            .disks
            .get_mut(&req.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;

        if !disk.attached_to.contains(&req.node_id) {
            if disk.access_mode == AccessMode::ReadWriteOnce && !disk.attached_to.is_empty() {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {} is attached to {}",
                    req.volume_id, disk.attached_to[0]
                )));
            }
            disk.attached_to.push(req.node_id.clone());
            info!(read_only = req.read_only, "disk attached");
        } else {
            debug!("disk already attached to node");
        }

        let mut context = PublishContext::new();
        if let Some(uuid) = disk.volume.volume_context.get(CONTEXT_DISK_UUID) {
            context.insert(CONTEXT_DISK_UUID.to_owned(), uuid.clone());
        }
        Ok(context)
    }

    #[instrument(skip(self))]
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
    ) -> Result<(), CsiError> {
        let Some(mut disk) = self.disks.get_mut(volume_id) else {
            debug!("disk gone, nothing to detach");
            return Ok(());
        };
        let before = disk.attached_to.len();
        disk.attached_to.retain(|n| n != node_id);
        if disk.attached_to.len() != before {
            info!("disk detached");
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        if !self.disks.contains_key(volume_id) {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        // A block disk can only be written from one VM at a time.
        Ok(capabilities
            .iter()
            .all(|cap| cap.access_mode != AccessMode::ReadWriteMany))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Ok(self
            .disks
            .iter()
            .map(|entry| entry.value().volume.clone())
            .collect())
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        let allocated = self.allocated.lock().map_err(CsiError::internal)?;
        Ok(self.config.capacity_bytes.saturating_sub(*allocated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    fn make_controller() -> FcdController {
        FcdController::new(FcdConfig {
            capacity_bytes: 10 * GIB,
            ..FcdConfig::default()
        })
    }

    fn create_req(name: &str, capacity_bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes,
            ..Default::default()
        }
    }

    fn publish_req(volume_id: &VolumeId, node: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: node.into(),
            volume_capability: VolumeCapability::default(),
            read_only: false,
        }
    }

    #[tokio::test]
    async fn create_and_delete_volume() {
        let fcd = make_controller();

        let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        assert!(vol.volume_id.0.starts_with("fcd-"));
        assert_eq!(vol.volume_context[CONTEXT_DATASTORE], "datastore1");
        assert!(fcd.names.contains_key("pvc-1"));
        assert_eq!(fcd.list_volumes().await.unwrap().len(), 1);

        fcd.delete_volume(&vol.volume_id).await.unwrap();
        assert!(!fcd.names.contains_key("pvc-1"));
        assert!(fcd.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_volume_idempotent_by_name() {
        let fcd = make_controller();
        let vol1 = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        let vol2 = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        assert_eq!(vol1.volume_id, vol2.volume_id);
        assert_eq!(fcd.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_volume_same_name_different_size() {
        let fcd = make_controller();
        fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        let result = fcd.create_volume(create_req("pvc-1", 2 * GIB)).await;
        assert!(matches!(result, Err(CsiError::VolumeAlreadyExists(_))));
    }

    #[tokio::test]
    async fn create_volume_rejects_bad_arguments() {
        let fcd = make_controller();
        assert!(matches!(
            fcd.create_volume(create_req("", GIB)).await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            fcd.create_volume(create_req("pvc-1", 0)).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn capacity_is_tracked() {
        let fcd = make_controller();
        fcd.create_volume(create_req("pvc-1", 4 * GIB)).await.unwrap();
        assert_eq!(fcd.get_capacity().await.unwrap(), 6 * GIB);

        let result = fcd.create_volume(create_req("pvc-2", 7 * GIB)).await;
        assert!(matches!(result, Err(CsiError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn delete_missing_volume_succeeds() {
        let fcd = make_controller();
        fcd.delete_volume(&VolumeId("fcd-nope".into())).await.unwrap();
    }

    #[tokio::test]
    async fn attach_and_detach() {
        let fcd = make_controller();
        let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();

        let ctx = fcd
            .controller_publish_volume(publish_req(&vol.volume_id, "node-1"))
            .await
            .unwrap();
        assert_eq!(
            ctx.get(CONTEXT_DISK_UUID),
            vol.volume_context.get(CONTEXT_DISK_UUID)
        );

        // Repeated attach to the same node is idempotent.
        fcd.controller_publish_volume(publish_req(&vol.volume_id, "node-1"))
            .await
            .unwrap();

        // Attached disks cannot be deleted.
        let result = fcd.delete_volume(&vol.volume_id).await;
        assert!(matches!(result, Err(CsiError::FailedPrecondition(_))));

        fcd.controller_unpublish_volume(&vol.volume_id, &"node-1".into())
            .await
            .unwrap();
        fcd.controller_unpublish_volume(&vol.volume_id, &"node-1".into())
            .await
            .unwrap();
        fcd.delete_volume(&vol.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn single_writer_disk_rejects_second_node() {
        let fcd = make_controller();
        let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        fcd.controller_publish_volume(publish_req(&vol.volume_id, "node-1"))
            .await
            .unwrap();
        let result = fcd
            .controller_publish_volume(publish_req(&vol.volume_id, "node-2"))
            .await;
        assert!(matches!(result, Err(CsiError::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn read_only_many_disk_attaches_to_several_nodes() {
        let fcd = make_controller();
        let vol = fcd
            .create_volume(CreateVolumeRequest {
                name: "shared".into(),
                capacity_bytes: GIB,
                volume_capabilities: vec![VolumeCapability {
                    access_mode: AccessMode::ReadOnlyMany,
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        for node in ["node-1", "node-2"] {
            fcd.controller_publish_volume(publish_req(&vol.volume_id, node))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn attach_missing_volume() {
        let fcd = make_controller();
        let result = fcd
            .controller_publish_volume(publish_req(&VolumeId("fcd-nope".into()), "node-1"))
            .await;
        assert!(matches!(result, Err(CsiError::VolumeNotFound(_))));
    }

    #[tokio::test]
    async fn validate_capabilities() {
        let fcd = make_controller();
        let missing = fcd
            .validate_volume_capabilities(&VolumeId("nope".into()), &[VolumeCapability::default()])
            .await;
        assert!(matches!(missing, Err(CsiError::VolumeNotFound(_))));

        let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        let empty = fcd.validate_volume_capabilities(&vol.volume_id, &[]).await;
        assert!(matches!(empty, Err(CsiError::InvalidArgument(_))));

        let rwo = VolumeCapability::default();
        let rwx = VolumeCapability {
            access_mode: AccessMode::ReadWriteMany,
            ..Default::default()
        };
        assert!(fcd
            .validate_volume_capabilities(&vol.volume_id, &[rwo])
            .await
            .unwrap());
        assert!(!fcd
            .validate_volume_capabilities(&vol.volume_id, &[rwx])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn volumes_carry_no_topology() {
        let fcd = make_controller();
        let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();
        assert!(vol.accessible_topology.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_creates_share_one_disk_per_name() {
        for _ in 0..100 {
            let fcd = Arc::new(make_controller());
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let fcd = Arc::clone(&fcd);
                    tokio::spawn(async move {
                        let name = format!("pvc-{}", i % 2);
                        fcd.create_volume(create_req(&name, GIB)).await
                    })
                })
                .collect();

            let mut ids: HashMap<String, VolumeId> = HashMap::new();
            for task in tasks {
                let vol = task.await.unwrap().unwrap();
                let name = vol.parameters[PARAM_CSI_NAME].clone();
                let id = ids.entry(name).or_insert_with(|| vol.volume_id.clone());
                assert_eq!(*id, vol.volume_id);
            }
            assert_eq!(fcd.list_volumes().await.unwrap().len(), 2);
            assert_eq!(fcd.get_capacity().await.unwrap(), 8 * GIB);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_creates_stay_within_capacity() {
        for _ in 0..100 {
            let fcd = Arc::new(FcdController::new(FcdConfig {
                capacity_bytes: 3 * GIB,
                ..FcdConfig::default()
            }));
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let fcd = Arc::clone(&fcd);
                    tokio::spawn(async move {
                        fcd.create_volume(create_req(&format!("pvc-{i}"), GIB)).await
                    })
                })
                .collect();

            let mut created = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => created += 1,
                    Err(e) => assert!(matches!(e, CsiError::ResourceExhausted(_))),
                }
            }
            assert_eq!(created, 3);
            assert_eq!(fcd.get_capacity().await.unwrap(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_never_removes_attached_disk() {
        for _ in 0..200 {
            let fcd = Arc::new(make_controller());
            let vol = fcd.create_volume(create_req("pvc-1", GIB)).await.unwrap();

            let attach = {
                let fcd = Arc::clone(&fcd);
                let id = vol.volume_id.clone();
                tokio::spawn(async move {
                    fcd.controller_publish_volume(publish_req(&id, "node-1")).await
                })
            };
            let delete = {
                let fcd = Arc::clone(&fcd);
                let id = vol.volume_id.clone();
                tokio::spawn(async move { fcd.delete_volume(&id).await })
            };

            let attached = attach.await.unwrap().is_ok();
            let deleted = delete.await.unwrap().is_ok();
            // Exactly one of them wins.
            assert!(attached != deleted, "attached={attached} deleted={deleted}");
            assert_eq!(fcd.list_volumes().await.unwrap().len(), usize::from(attached));
        }
    }

    #[tokio::test]
    async fn delete_releases_capacity_and_name() {
        let fcd = make_controller();
        let vol = fcd.create_volume(create_req("pvc-1", 4 * GIB)).await.unwrap();
        fcd.delete_volume(&vol.volume_id).await.unwrap();
        assert_eq!(fcd.get_capacity().await.unwrap(), 10 * GIB);

        let again = fcd.create_volume(create_req("pvc-1", 4 * GIB)).await.unwrap();
        assert_ne!(again.volume_id, vol.volume_id);
    }

    #[test]
    fn load_cloud_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "vcenter: vc.example.com\ndatacenter: dc-1\ndatastore: vsanDatastore\ncapacityBytes: 2048"
        )
        .unwrap();

        let cfg = FcdConfig::load(file.path()).unwrap();
        assert_eq!(cfg.vcenter, "vc.example.com");
        assert_eq!(cfg.datastore, "vsanDatastore");
        assert_eq!(cfg.capacity_bytes, 2048);
    }

    #[test]
    fn load_cloud_config_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "vcenter: vc.example.com").unwrap();

        let cfg = FcdConfig::load(file.path()).unwrap();
        assert_eq!(cfg.datastore, FcdConfig::default().datastore);
    }

    #[test]
    fn load_cloud_config_rejects_empty_datastore() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datastore: \"\"").unwrap();
        assert!(matches!(
            FcdConfig::load(file.path()),
            Err(CsiError::BackendError(_))
        ));
    }

    #[test]
    fn load_cloud_config_missing_file() {
        let err = FcdConfig::load(Path::new("/nonexistent/vsphere.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vsphere.yaml"));
    }
}
