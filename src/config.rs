//! Configuration: [`NodePolicy`] loading, environment overrides, and
//! file-based hot reload.
//!
//! Configuration loading, as such, is an external collaborator to the
//! reconciliation engine — but the engine's only contract with it is a
//! `NodePolicy` snapshot, immutable for the duration of one reconcile pass.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const ENV_PREFIX: &str = "MECHANIC_";
const DEFAULT_POLLING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("node name not set: pass --node-name or set MECHANIC_NODE_NAME")]
    MissingNodeName,
    #[error("failed to watch config file {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Per-event-kind drain policy for platform-scheduled VM events.
///
/// `freeze` governs regular (non-live-migration) freezes; `live_migration`
/// governs freezes whose description identifies them as a memory-preserving
/// live migration. The two are distinct despite sharing a wire-level event
/// type of `Freeze`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledEventPolicy {
    pub freeze: bool,
    pub reboot: bool,
    pub redeploy: bool,
    pub preempt: bool,
    pub terminate: bool,
    pub live_migration: bool,
}

impl Default for ScheduledEventPolicy {
    fn default() -> Self {
        Self {
            freeze: false,
            reboot: false,
            redeploy: true,
            preempt: true,
            terminate: true,
            live_migration: true,
        }
    }
}

/// Per-condition drain policy for host-health conditions, plus the polling
/// interval used when the problem detector is bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionalConditionPolicy {
    pub kubelet_problem: bool,
    pub kernel_deadlock: bool,
    pub frequent_kubelet_restarts: bool,
    pub frequent_containerd_restarts: bool,
    pub fs_corrupt: bool,
    pub polling_interval: u64,
}

impl Default for OptionalConditionPolicy {
    fn default() -> Self {
        Self {
            kubelet_problem: false,
            kernel_deadlock: false,
            frequent_kubelet_restarts: false,
            frequent_containerd_restarts: false,
            fs_corrupt: false,
            polling_interval: DEFAULT_POLLING_INTERVAL_SECS,
        }
    }
}

impl OptionalConditionPolicy {
    /// Polling interval floored at 1 second, per spec.
    pub fn polling_interval_secs(&self) -> u64 {
        self.polling_interval.max(1)
    }
}

/// Immutable configuration snapshot consulted by one reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePolicy {
    pub scheduled_events: ScheduledEventPolicy,
    pub optional_conditions: OptionalConditionPolicy,
    pub bypass_problem_detector: bool,
    pub enable_tracing: bool,
    pub runtime_env: String,
    #[serde(skip)]
    pub node_name: String,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            scheduled_events: ScheduledEventPolicy::default(),
            optional_conditions: OptionalConditionPolicy::default(),
            bypass_problem_detector: false,
            enable_tracing: false,
            runtime_env: "prod".to_string(),
            node_name: String::new(),
        }
    }
}

impl NodePolicy {
    /// Load a policy from an optional TOML file, then apply `MECHANIC_*`
    /// environment overrides. Falls back to [`NodePolicy::default`] with a
    /// warning if the file exists but fails to parse — a `PolicyLoadError`
    /// in spec terms, recovered locally rather than propagated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut policy = match path {
            Some(path) if path.exists() => match read_file(path) {
                Ok(policy) => policy,
                Err(ConfigError::Parse { path, source }) => {
                    warn!(path = %path.display(), error = %source, "config_parse_failed_using_defaults");
                    Self::default()
                }
                Err(other) => return Err(other),
            },
            _ => Self::default(),
        };

        apply_env_overrides(&mut policy);

        if policy.node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }

        Ok(policy)
    }
}

fn read_file(path: &Path) -> Result<NodePolicy, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_bool(key: &str, current: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => current,
    }
}

fn env_u64(key: &str, current: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

fn apply_env_overrides(policy: &mut NodePolicy) {
    let se = &mut policy.scheduled_events;
    se.freeze = env_bool(&format!("{ENV_PREFIX}SCHEDULED_EVENTS_FREEZE"), se.freeze);
    se.reboot = env_bool(&format!("{ENV_PREFIX}SCHEDULED_EVENTS_REBOOT"), se.reboot);
    se.redeploy = env_bool(&format!("{ENV_PREFIX}SCHEDULED_EVENTS_REDEPLOY"), se.redeploy);
    se.preempt = env_bool(&format!("{ENV_PREFIX}SCHEDULED_EVENTS_PREEMPT"), se.preempt);
    se.terminate = env_bool(&format!("{ENV_PREFIX}SCHEDULED_EVENTS_TERMINATE"), se.terminate);
    se.live_migration = env_bool(
        &format!("{ENV_PREFIX}SCHEDULED_EVENTS_LIVE_MIGRATION"),
        se.live_migration,
    );

    let oc = &mut policy.optional_conditions;
    oc.kubelet_problem = env_bool(
        &format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_KUBELET_PROBLEM"),
        oc.kubelet_problem,
    );
    oc.kernel_deadlock = env_bool(
        &format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_KERNEL_DEADLOCK"),
        oc.kernel_deadlock,
    );
    oc.frequent_kubelet_restarts = env_bool(
        &format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_FREQUENT_KUBELET_RESTARTS"),
        oc.frequent_kubelet_restarts,
    );
    oc.frequent_containerd_restarts = env_bool(
        &format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_FREQUENT_CONTAINERD_RESTARTS"),
        oc.frequent_containerd_restarts,
    );
    oc.fs_corrupt = env_bool(&format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_FS_CORRUPT"), oc.fs_corrupt);
    oc.polling_interval = env_u64(
        &format!("{ENV_PREFIX}OPTIONAL_CONDITIONS_POLLING_INTERVAL"),
        oc.polling_interval,
    )
    .max(1);

    policy.bypass_problem_detector = env_bool(
        &format!("{ENV_PREFIX}BYPASS_NODE_PROBLEM_DETECTOR"),
        policy.bypass_problem_detector,
    );
    policy.enable_tracing = env_bool(&format!("{ENV_PREFIX}ENABLE_TRACING"), policy.enable_tracing);
    if let Ok(env) = env::var(format!("{ENV_PREFIX}RUNTIME_ENV")) {
        policy.runtime_env = env;
    }
    if let Ok(name) = env::var(format!("{ENV_PREFIX}NODE_NAME")) {
        policy.node_name = name;
    }
}

/// Watches a configuration file for changes and reloads [`NodePolicy`] on
/// each modification. New values apply only to subsequent reconcile
/// passes — the driver polls [`ConfigWatcher::poll_reload`] once per tick.
pub struct ConfigWatcher {
    path: PathBuf,
    rx: Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let (tx, rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|source| ConfigError::Watch {
            path: path.clone(),
            source,
        })?;

        if let Some(dir) = path.parent().filter(|p| p.exists()) {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|source| ConfigError::Watch {
                    path: path.clone(),
                    source,
                })?;
        }

        Ok(Self {
            path,
            rx,
            _watcher: watcher,
        })
    }

    /// Returns `Some(new_policy)` if the watched file changed since the
    /// last poll and reloaded cleanly; `None` otherwise (no change, or a
    /// reload failure already logged by [`NodePolicy::load`]).
    pub fn poll_reload(&self, node_name: &str) -> Option<NodePolicy> {
        let mut changed = false;
        while let Ok(Ok(event)) = self.rx.try_recv() {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                && event.paths.iter().any(|p| p == &self.path)
            {
                changed = true;
            }
        }

        if !changed {
            return None;
        }

        match NodePolicy::load(Some(&self.path)) {
            Ok(mut policy) => {
                if policy.node_name.is_empty() {
                    policy.node_name = node_name.to_string();
                }
                Some(policy)
            }
            Err(e) => {
                warn!(error = %e, "config_reload_failed_keeping_previous");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_policy_matches_spec_defaults() {
        let p = NodePolicy::default();
        assert!(p.scheduled_events.live_migration);
        assert!(p.scheduled_events.redeploy);
        assert!(p.scheduled_events.preempt);
        assert!(p.scheduled_events.terminate);
        assert!(!p.scheduled_events.freeze);
        assert!(!p.scheduled_events.reboot);
        assert!(!p.optional_conditions.kubelet_problem);
        assert_eq!(p.optional_conditions.polling_interval_secs(), 30);
        assert_eq!(p.runtime_env, "prod");
    }

    #[test]
    fn polling_interval_floors_at_one_second() {
        let p = OptionalConditionPolicy {
            polling_interval: 0,
            ..Default::default()
        };
        assert_eq!(p.polling_interval_secs(), 1);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults_plus_env_node_name() {
        unsafe {
            env::set_var("MECHANIC_NODE_NAME", "test-vmss000009");
        }
        let p = NodePolicy::load(Some(Path::new("/nonexistent/does-not-exist.toml"))).unwrap();
        assert_eq!(p.node_name, "test-vmss000009");
        assert!(p.scheduled_events.live_migration);
        unsafe {
            env::remove_var("MECHANIC_NODE_NAME");
        }
    }

    #[test]
    fn load_parses_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            runtime_env = "dev"
            [scheduled_events]
            freeze = true
            live_migration = false
            "#
        )
        .unwrap();

        unsafe {
            env::set_var("MECHANIC_NODE_NAME", "test-vmss000001");
        }
        let p = NodePolicy::load(Some(file.path())).unwrap();
        assert_eq!(p.runtime_env, "dev");
        assert!(p.scheduled_events.freeze);
        assert!(!p.scheduled_events.live_migration);
        unsafe {
            env::remove_var("MECHANIC_NODE_NAME");
        }
    }

    #[test]
    fn malformed_toml_recovers_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not valid toml {{{{").unwrap();

        unsafe {
            env::set_var("MECHANIC_NODE_NAME", "test-vmss000001");
        }
        let p = NodePolicy::load(Some(file.path())).unwrap();
        assert_eq!(p.runtime_env, "prod");
        unsafe {
            env::remove_var("MECHANIC_NODE_NAME");
        }
    }

    #[test]
    fn missing_node_name_is_an_error() {
        unsafe {
            env::remove_var("MECHANIC_NODE_NAME");
        }
        let err = NodePolicy::load(None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingNodeName));
    }
}
