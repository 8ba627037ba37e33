//! Registry of provisioning backends.
//!
//! The set of backends is closed: every variant of [`Api`] names one backend
//! by its canonical identifier and knows how to construct it.  Adding a
//! backend means adding a variant here; the selector in
//! [`crate::service`] only ever goes through [`Api::parse`] and
//! [`Api::build`].

pub mod fcd;

use std::fmt;
use std::sync::Arc;

use crate::config::PluginConfig;
use crate::controller::CsiController;
use crate::error::CsiError;

use self::fcd::FcdController;

/// Canonical backend identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    /// vSphere First Class Disks.
    Fcd,
}

impl Api {
    /// Every registered backend, in match order.
    pub const ALL: &'static [Api] = &[Api::Fcd];

    /// Backend used when no identifier is configured.
    pub const DEFAULT: Api = Api::Fcd;

    /// The identifier this backend is selected by.
    pub fn canonical(self) -> &'static str {
        match self {
            Api::Fcd => "FCD",
        }
    }

    /// Match `raw` against the canonical identifiers, ignoring ASCII case.
    ///
    /// Returns the first match, or `None` when the identifier is unknown.
    pub fn parse(raw: &str) -> Option<Api> {
        Self::ALL
            .iter()
            .copied()
            .find(|api| api.canonical().eq_ignore_ascii_case(raw))
    }

    /// Construct a fresh instance of this backend.
    ///
    /// Initialization failures are returned as-is; callers must not fall
    /// back to another backend.
    pub fn build(self, config: &PluginConfig) -> Result<Arc<dyn CsiController>, CsiError> {
        match self {
            Api::Fcd => Ok(Arc::new(FcdController::from_config(config)?)),
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}
