//! Configuration for the controller and for individual instances.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::GatePolicy;

// ============================================================================
// Instance configuration
// ============================================================================

/// Declared configuration of an instance.
///
/// Everything here is passed through to the native layer opaquely: the
/// controller persists it and hands it to `NativeRuntime::open`, but never
/// interprets limit keys, mount syntax, or network attachments itself —
/// those belong to the native runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Native template used to materialize the instance (e.g. "busybox",
    /// "download"). `None` means the native layer's default.
    #[serde(default)]
    pub template: Option<String>,

    /// Extra arguments forwarded to the template verbatim.
    #[serde(default)]
    pub template_args: Vec<String>,

    /// Resource-limit entries, key → value, forwarded verbatim
    /// (e.g. `memory.max` → `512M`).
    #[serde(default)]
    pub limits: BTreeMap<String, String>,

    /// Mount entries forwarded verbatim.
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Network attachment forwarded verbatim.
    #[serde(default)]
    pub network: Option<String>,

    /// Grace period the native layer gives the payload on stop before
    /// escalating, in seconds.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_stop_timeout_secs() -> u64 {
    30
}

impl InstanceConfig {
    /// Configuration with a native template and otherwise defaults.
    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            stop_timeout_secs: default_stop_timeout_secs(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Controller options
// ============================================================================

/// Options for [`Controller::open`](crate::Controller::open).
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Directory holding the instance database, the controller lock, and
    /// log output. Must be an absolute path; created if absent.
    pub state_dir: PathBuf,

    /// How often the reconciler compares recorded state against the
    /// native layer for supervised instances.
    pub reconcile_interval: Duration,

    /// Deadline applied by the convenience operation methods
    /// (`start`/`stop`/...) when the caller does not build an
    /// [`Operation`](crate::Operation) explicitly.
    pub default_deadline: Duration,

    /// Depth of each instance's operation queue. Submissions beyond this
    /// wait for space (still in submission order).
    pub queue_depth: usize,

    /// Capability gate policy applied before privileged native calls.
    pub gate: GatePolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            reconcile_interval: Duration::from_secs(2),
            default_deadline: Duration::from_secs(30),
            queue_depth: 16,
            gate: GatePolicy::Permissive,
        }
    }
}

impl ControllerOptions {
    /// Options rooted at an explicit state directory.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }
}

/// Default state directory: `$XDG_DATA_HOME/penlite` (or the platform
/// equivalent), falling back to `.penlite` under the home directory.
pub fn default_state_dir() -> PathBuf {
    if let Some(data) = dirs::data_local_dir() {
        data.join("penlite")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".penlite")
    } else {
        PathBuf::from("/var/lib/penlite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_config_serde_round_trip() {
        let mut config = InstanceConfig::with_template("busybox");
        config
            .limits
            .insert("memory.max".to_string(), "512M".to_string());
        config.mounts.push("/srv/data data none bind 0 0".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let back: InstanceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn instance_config_defaults_from_empty_json() {
        let config: InstanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.template, None);
        assert_eq!(config.stop_timeout_secs, 30);
        assert!(config.limits.is_empty());
    }
}
