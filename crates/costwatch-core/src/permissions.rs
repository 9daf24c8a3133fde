//! Process-wide permission state.
//!
//! Built once from configuration and handed by value to every component that
//! gates a mutating or sensitive operation. There is no way to change it after
//! construction.

use crate::config::CostwatchConfig;
use crate::error::{CostError, Result};
use serde::Serialize;
use tracing::warn;

/// Immutable write / sensitive-data toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PermissionState {
    write_enabled: bool,
    sensitive_data_enabled: bool,
}

impl PermissionState {
    /// Creates a permission state.
    #[must_use]
    pub const fn new(write_enabled: bool, sensitive_data_enabled: bool) -> Self {
        Self { write_enabled, sensitive_data_enabled }
    }

    /// Everything disabled.
    #[must_use]
    pub const fn read_only() -> Self {
        Self::new(false, false)
    }

    /// Reads the toggles from configuration.
    #[must_use]
    pub fn from_config(config: &CostwatchConfig) -> Self {
        Self::new(config.permissions.write_enabled, config.permissions.sensitive_data_enabled)
    }

    /// Whether mutating actions are allowed.
    #[must_use]
    pub const fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Whether user- and query-level detail may be returned.
    #[must_use]
    pub const fn sensitive_data_enabled(&self) -> bool {
        self.sensitive_data_enabled
    }

    /// Fails closed unless writes are enabled.
    ///
    /// # Errors
    /// Returns `CostError::PermissionDenied` when writes are disabled.
    pub fn require_write(&self, operation: &str) -> Result<()> {
        if self.write_enabled {
            return Ok(());
        }
        warn!(operation = %operation, "Write operation refused: write access disabled");
        Err(CostError::PermissionDenied {
            operation: operation.to_string(),
            requirement: "write_enabled".to_string(),
        })
    }

    /// Fails closed unless sensitive data access is enabled.
    ///
    /// # Errors
    /// Returns `CostError::PermissionDenied` when sensitive data is disabled.
    pub fn require_sensitive(&self, operation: &str) -> Result<()> {
        if self.sensitive_data_enabled {
            return Ok(());
        }
        warn!(operation = %operation, "Sensitive operation refused: sensitive data access disabled");
        Err(CostError::PermissionDenied {
            operation: operation.to_string(),
            requirement: "sensitive_data_enabled".to_string(),
        })
    }
}
