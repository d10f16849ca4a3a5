//! Template rendering for mounted rootfs directories
//!
//! Files ending in `.tmpl` are rendered with the cluster env and written
//! beside the template without the suffix. A template that references a key
//! missing from the env fails the whole render.

use crate::env::EnvMap;
use crate::error::{FlotillaError, FlotillaResult};
use std::path::{Path, PathBuf};
use tera::{Context, Tera};
use tracing::debug;
use walkdir::WalkDir;

pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Rewrites template-bearing files under a directory in place.
pub trait TemplateRenderer: Send + Sync {
    fn render_dir(&self, dir: &Path, data: &EnvMap) -> FlotillaResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TeraRenderer;

impl TeraRenderer {
    pub fn new() -> Self {
        Self
    }

    fn render_file(&self, template: &Path, context: &Context) -> FlotillaResult<PathBuf> {
        let source = std::fs::read_to_string(template).map_err(|e| FlotillaError::Render {
            path: template.to_path_buf(),
            message: format!("failed to read template: {}", e),
        })?;

        let rendered = Tera::one_off(&source, context, false).map_err(|e| FlotillaError::Render {
            path: template.to_path_buf(),
            message: describe_tera_error(&e),
        })?;

        let target = strip_suffix(template);
        std::fs::write(&target, rendered).map_err(|e| FlotillaError::Render {
            path: target.clone(),
            message: format!("failed to write rendered file: {}", e),
        })?;
        Ok(target)
    }
}

impl TemplateRenderer for TeraRenderer {
    fn render_dir(&self, dir: &Path, data: &EnvMap) -> FlotillaResult<()> {
        let context = Context::from_serialize(data).map_err(|e| FlotillaError::Render {
            path: dir.to_path_buf(),
            message: describe_tera_error(&e),
        })?;

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| FlotillaError::Render {
                path: dir.to_path_buf(),
                message: format!("failed to walk directory: {}", e),
            })?;
            if !entry.file_type().is_file() || !is_template(entry.path()) {
                continue;
            }
            let target = self.render_file(entry.path(), &context)?;
            debug!(template = ?entry.path(), target = ?target, "rendered template");
        }
        Ok(())
    }
}

fn is_template(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(TEMPLATE_SUFFIX) && n.len() > TEMPLATE_SUFFIX.len())
        .unwrap_or(false)
}

fn strip_suffix(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(TEMPLATE_SUFFIX))
        .unwrap_or_default();
    path.with_file_name(name)
}

/// Tera nests the useful part of the message in the source chain.
fn describe_tera_error(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
