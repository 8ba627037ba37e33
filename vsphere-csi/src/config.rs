//! Process-start configuration.
//!
//! Everything the plugin needs is read once from the environment and then
//! passed around by value.
//!
//! Environment variables:
//! - `X_CSI_VSPHERE_APINAME`: backend API identifier, case-insensitive.
//!   Unset or empty selects `FCD`.
//! - `CSI_ENDPOINT`: unix socket the protocol runtime listens on. A leading
//!   `unix://` is stripped. Defaults to [`DEFAULT_ENDPOINT`].
//! - `X_CSI_VSPHERE_NODE_NAME`: node identifier reported by `NodeGetInfo`.
//!   Falls back to `HOSTNAME`, then `localhost`.
//! - `X_CSI_VSPHERE_CLOUD_CONFIG`: optional path of the vSphere cloud-config
//!   YAML file consumed by the FCD backend.

use std::path::PathBuf;

/// Name of the environment variable selecting the backend API.
pub const ENV_API: &str = "X_CSI_VSPHERE_APINAME";
/// Name of the environment variable holding the CSI endpoint.
pub const ENV_ENDPOINT: &str = "CSI_ENDPOINT";
/// Name of the environment variable holding the node name.
pub const ENV_NODE_NAME: &str = "X_CSI_VSPHERE_NODE_NAME";
/// Name of the environment variable holding the cloud-config path.
pub const ENV_CLOUD_CONFIG: &str = "X_CSI_VSPHERE_CLOUD_CONFIG";

/// Socket used when `CSI_ENDPOINT` is not set.
pub const DEFAULT_ENDPOINT: &str = "/var/lib/csi/sockets/pluginproxy/csi.sock";

/// Immutable plugin configuration captured at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Raw backend identifier, exactly as found in the environment.
    pub api: String,
    /// Filesystem path of the CSI unix socket.
    pub endpoint: PathBuf,
    /// Identifier of the node this process runs on.
    pub node_id: String,
    /// Optional cloud-config file for the backend.
    pub cloud_config: Option<PathBuf>,
}

impl PluginConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let endpoint = non_empty(ENV_ENDPOINT)
            .map(|v| match v.strip_prefix("unix://") {
                Some(path) => path.to_owned(),
                None => v,
            })
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());

        Self {
            api: lookup(ENV_API).unwrap_or_default(),
            endpoint: PathBuf::from(endpoint),
            node_id: non_empty(ENV_NODE_NAME)
                .or_else(|| non_empty("HOSTNAME"))
                .unwrap_or_else(|| "localhost".to_owned()),
            cloud_config: non_empty(ENV_CLOUD_CONFIG).map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> PluginConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        PluginConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.api, "");
        assert_eq!(cfg.endpoint, PathBuf::from(DEFAULT_ENDPOINT));
        assert_eq!(cfg.node_id, "localhost");
        assert!(cfg.cloud_config.is_none());
    }

    #[test]
    fn api_is_kept_verbatim() {
        let cfg = config_from(&[(ENV_API, "Fcd")]);
        assert_eq!(cfg.api, "Fcd");
    }

    #[test]
    fn unix_scheme_is_stripped() {
        let cfg = config_from(&[(ENV_ENDPOINT, "unix:///csi/csi.sock")]);
        assert_eq!(cfg.endpoint, PathBuf::from("/csi/csi.sock"));
    }

    #[test]
    fn node_name_falls_back_to_hostname() {
        let cfg = config_from(&[("HOSTNAME", "worker-3")]);
        assert_eq!(cfg.node_id, "worker-3");

        let cfg = config_from(&[("HOSTNAME", "worker-3"), (ENV_NODE_NAME, "vm-7")]);
        assert_eq!(cfg.node_id, "vm-7");
    }

    #[test]
    fn cloud_config_path() {
        let cfg = config_from(&[(ENV_CLOUD_CONFIG, "/etc/cloud/vsphere.yaml")]);
        assert_eq!(
            cfg.cloud_config,
            Some(PathBuf::from("/etc/cloud/vsphere.yaml"))
        );
    }
}
