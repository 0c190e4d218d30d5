//! Configuration diffing for `reload`.
//!
//! [`compute_diff`] partitions the enabled backends of two configurations
//! into added / removed / modified / unchanged buckets. The dispatcher
//! applies the patch: unchanged connectors keep their live instance,
//! everything else is reconnected or torn down.
//!
//! # Limitations
//!
//! Server address changes (`server.host`, `server.port`) and control
//! endpoint changes cannot be applied without rebinding a listener. They are
//! flagged so the caller can warn; the process must be restarted for them.

use std::collections::BTreeMap;

use crate::config::{BackendConfig, Config};

/// Structural diff between two [`Config`] snapshots.
///
/// Every list is in connector id order.
#[derive(Debug, Default, Clone)]
pub struct ConfigPatch {
    /// Enabled in `new`, absent or disabled in `old`
    pub backends_added: Vec<(String, BackendConfig)>,
    /// Enabled in `old`, absent or disabled in `new`
    pub backends_removed: Vec<String>,
    /// Enabled in both with a different descriptor
    pub backends_modified: Vec<(String, BackendConfig)>,
    /// Enabled in both with an identical descriptor
    pub backends_unchanged: Vec<String>,
    /// `server.host` or `server.port` changed (restart required)
    pub server_changed: bool,
    /// The control endpoint changed (restart required)
    pub control_changed: bool,
    /// Grants or time budgets changed
    pub gateway_changed: bool,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends_added.is_empty()
            && self.backends_removed.is_empty()
            && self.backends_modified.is_empty()
            && !self.server_changed
            && !self.control_changed
            && !self.gateway_changed
    }

    /// Ids that need a fresh connection (added, then modified)
    pub fn to_connect(&self) -> impl Iterator<Item = &(String, BackendConfig)> {
        self.backends_added.iter().chain(&self.backends_modified)
    }

    /// Human-readable summary of the patch (one clause per change type).
    #[must_use]
    pub fn summary(&self) -> String {
        let ids = |list: &[(String, BackendConfig)]| {
            list.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", ")
        };

        let mut parts = Vec::new();
        if !self.backends_added.is_empty() {
            parts.push(format!("added backends: [{}]", ids(&self.backends_added)));
        }
        if !self.backends_removed.is_empty() {
            parts.push(format!(
                "removed backends: [{}]",
                self.backends_removed.join(", ")
            ));
        }
        if !self.backends_modified.is_empty() {
            parts.push(format!("modified backends: [{}]", ids(&self.backends_modified)));
        }
        if self.gateway_changed {
            parts.push("gateway permissions/timeouts changed".to_string());
        }
        if self.server_changed {
            parts.push("server address changed (restart required)".to_string());
        }
        if self.control_changed {
            parts.push("control endpoint changed (restart required)".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compute the structural diff between two config snapshots.
///
/// Pure: the caller applies the returned [`ConfigPatch`].
///
/// # Examples
///
/// ```
/// use mcp_hub::config::Config;
/// use mcp_hub::config_reload::compute_diff;
///
/// let patch = compute_diff(&Config::default(), &Config::default());
/// assert!(patch.is_empty());
/// ```
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let mut patch = ConfigPatch {
        server_changed: old.server.host != new.server.host || old.server.port != new.server.port,
        control_changed: json_differs(&old.control, &new.control),
        gateway_changed: json_differs(&old.gateway, &new.gateway),
        ..ConfigPatch::default()
    };
    classify_backends(old, new, &mut patch);
    patch
}

fn enabled(config: &Config) -> BTreeMap<&str, &BackendConfig> {
    config
        .enabled_backends()
        .map(|(k, v)| (k.as_str(), v))
        .collect()
}

/// Partition backends into the four buckets.
fn classify_backends(old: &Config, new: &Config, patch: &mut ConfigPatch) {
    let old_enabled = enabled(old);
    let new_enabled = enabled(new);

    for (&name, &cfg) in &new_enabled {
        match old_enabled.get(name) {
            None => patch.backends_added.push((name.to_string(), cfg.clone())),
            Some(old_cfg) if backend_config_changed(old_cfg, cfg) => {
                patch.backends_modified.push((name.to_string(), cfg.clone()));
            }
            Some(_) => patch.backends_unchanged.push(name.to_string()),
        }
    }

    patch.backends_removed = old_enabled
        .keys()
        .filter(|name| !new_enabled.contains_key(*name))
        .map(|name| (*name).to_string())
        .collect();
}

/// Deep equality through the serialized descriptor.
fn backend_config_changed(old: &BackendConfig, new: &BackendConfig) -> bool {
    json_differs(old, new)
}

fn json_differs<T: serde::Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}
