//! Writes user supplied config entries into a mounted rootfs
//!
//! Runs before template rendering, so an entry may itself be a `.tmpl` file.

use crate::error::{FlotillaError, FlotillaResult};
use crate::types::{ConfigEntry, ConfigStrategy};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_yaml::{Mapping, Value};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ConfigDumper {
    entries: Vec<ConfigEntry>,
}

impl ConfigDumper {
    pub fn new(entries: Vec<ConfigEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    /// Write every entry under `mount_dir`, in order.
    pub fn dump(&self, mount_dir: &Path) -> FlotillaResult<()> {
        for entry in &self.entries {
            let target = resolve_target(mount_dir, &entry.path)?;
            let data = process_data(entry).map_err(|message| FlotillaError::ConfigDump {
                path: target.clone(),
                message,
            })?;

            let contents = match entry.strategy {
                ConfigStrategy::Override => data,
                ConfigStrategy::Merge if target.exists() => {
                    let existing = std::fs::read_to_string(&target)?;
                    merge_yaml(&existing, &data).map_err(|message| FlotillaError::ConfigDump {
                        path: target.clone(),
                        message,
                    })?
                }
                ConfigStrategy::Merge => data,
            };

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
            debug!(
                config = %entry.name,
                path = ?target,
                strategy = ?entry.strategy,
                "dumped config"
            );
        }
        Ok(())
    }
}

fn resolve_target(mount_dir: &Path, relative: &Path) -> FlotillaResult<PathBuf> {
    let escapes = relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(FlotillaError::ConfigDump {
            path: relative.to_path_buf(),
            message: "config path must be relative to the rootfs and stay inside it".to_string(),
        });
    }
    Ok(mount_dir.join(relative))
}

fn process_data(entry: &ConfigEntry) -> Result<String, String> {
    let steps: Vec<&str> = match &entry.process {
        Some(pipeline) => pipeline
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "value")
            .collect(),
        None => Vec::new(),
    };
    if steps.is_empty() {
        return Ok(entry.data.clone());
    }

    let mut mapping: Mapping = serde_yaml::from_str(&entry.data)
        .map_err(|e| format!("process '{}' needs a YAML mapping: {}", entry.name, e))?;

    for step in steps {
        for (_, value) in mapping.iter_mut() {
            *value = apply_step(step, value)?;
        }
    }
    serde_yaml::to_string(&mapping).map_err(|e| e.to_string())
}

fn apply_step(step: &str, value: &Value) -> Result<Value, String> {
    match step {
        "toJson" => serde_json::to_string(value)
            .map(Value::String)
            .map_err(|e| e.to_string()),
        "toBase64" => {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other)
                    .map_err(|e| e.to_string())?
                    .trim_end()
                    .to_string(),
            };
            Ok(Value::String(STANDARD.encode(raw)))
        }
        other => Err(format!("unknown process step '{}'", other)),
    }
}

fn merge_yaml(existing: &str, incoming: &str) -> Result<String, String> {
    let mut base: Value = serde_yaml::from_str(existing).map_err(|e| e.to_string())?;
    let overlay: Value = serde_yaml::from_str(incoming).map_err(|e| e.to_string())?;
    merge_values(&mut base, overlay);
    serde_yaml::to_string(&base).map_err(|e| e.to_string())
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
