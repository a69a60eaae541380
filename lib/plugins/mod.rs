//! Backend plugins and the registry that builds them from configuration.

pub mod docfs;
pub mod localfs;
pub mod memfs;

use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::plugin::Plugin;
use crate::types::{ConfigParam, PluginConfig};

/// Plugin kinds known to the registry, as written in configuration.
pub const KINDS: &[&str] = &["memory", "local", "docs"];

/// The configuration keys a plugin kind declares.
#[must_use]
pub fn config_params(kind: &str) -> Option<&'static [ConfigParam]> {
    match kind {
        "memory" => Some(&[]),
        "local" => Some(&[ConfigParam {
            name: "root",
            required: true,
            description: "Host directory this mount serves",
        }]),
        "docs" => Some(&[
            ConfigParam {
                name: "workers",
                required: false,
                description: "Indexing worker count (default 4)",
            },
            ConfigParam {
                name: "queue-capacity",
                required: false,
                description: "Pending indexing task cap (default 100)",
            },
        ]),
        _ => None,
    }
}

/// Check a mount's config against its plugin kind's declared keys.
///
/// Returns every problem found: an unknown kind, unknown keys, and
/// missing required keys.
#[must_use]
pub fn validate_config(kind: &str, config: &PluginConfig) -> Vec<String> {
    let Some(params) = config_params(kind) else {
        return vec![format!("unknown plugin kind {kind:?}")];
    };
    let mut problems = Vec::new();
    for key in config.keys() {
        if !params.iter().any(|p| p.name == key) {
            problems.push(format!("plugin {kind:?} does not recognise config key {key:?}"));
        }
    }
    for param in params {
        if param.required && !config.contains_key(param.name) {
            problems.push(format!(
                "plugin {kind:?} requires config key {:?} ({})",
                param.name, param.description
            ));
        }
    }
    problems
}

fn int_config(config: &PluginConfig, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(|v| v.as_int())
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(default)
}

/// Build a plugin instance. `instance` is the per-mount name used in
/// metadata and logs. Must be called on a tokio runtime (some plugins
/// spawn workers).
pub fn build(
    kind: &str,
    instance: &str,
    config: &PluginConfig,
) -> VfsResult<Arc<dyn Plugin>> {
    match kind {
        "memory" => Ok(Arc::new(memfs::MemFs::new(instance))),
        "local" => {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    VfsError::invalid_argument("local plugin requires a \"root\" config key")
                })?;
            Ok(Arc::new(localfs::LocalFs::new(instance, root)))
        }
        "docs" => {
            let workers = int_config(config, "workers", 0);
            let capacity = int_config(config, "queue-capacity", 0);
            Ok(Arc::new(docfs::DocFs::new(
                instance,
                Arc::new(docfs::InMemoryIndex::new()),
                workers,
                capacity,
            )))
        }
        other => Err(VfsError::invalid_argument(format!(
            "unknown plugin kind {other:?}"
        ))),
    }
}
