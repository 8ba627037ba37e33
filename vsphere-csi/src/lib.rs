//! # vsphere-csi: vSphere CSI plugin core
//!
//! `vsphere-csi` is the core of a [Container Storage Interface][csi] plugin
//! for vSphere.  It picks the provisioning backend named by the environment
//! at process start, exposes identity and node services plus the selected
//! controller through one service facade, and refuses to serve when the
//! configured backend could not be resolved.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & readiness. |
//! | [`controller`] | [`CsiController`] trait: provisioning, attach, detach. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`backend`] | Registry of provisioning backends (FCD). |
//! | [`config`] | [`PluginConfig`] read from the environment. |
//! | [`service`] | Backend selection, [`VsphereService`] facade, startup hook. |
//! | [`plugin`] | [`StoragePlugin`] lifecycle and the [`Serve`] runtime seam. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod node;
pub mod plugin;
pub mod service;
pub mod types;

pub use backend::Api;
pub use config::PluginConfig;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use node::CsiNode;
pub use plugin::{Serve, StoragePlugin};
pub use service::{ConfiguredApi, Service, VsphereService, select_backend};
pub use types::*;
