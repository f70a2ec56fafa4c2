// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Working directories for dynamic instances.
//!
//! Layout on disk:
//!
//! ```text
//! templates/
//! ├── .images/{image}/     defaults shared by every template of an image
//! ├── {template}/          template tree (and static volume backing)
//! └── {extra}/             extra directories declared by dynamic templates
//! running/
//! └── {internal_id}/       materialized per instance, bind-mounted
//! ```
//!
//! Materialization copies the layers in the order listed above; later layers
//! overwrite files from earlier ones. The directory is deleted at teardown and
//! the whole `running/` tree is swept at startup.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::traits::{Result, RuntimeError};

/// Directory holding per-image defaults, relative to the templates root.
pub const IMAGES_DIR: &str = ".images";

/// Owner of the templates and running directory trees.
#[derive(Debug, Clone)]
pub struct Workspace {
    templates_dir: PathBuf,
    running_dir: PathBuf,
}

impl Workspace {
    /// Create a workspace over the two roots.
    pub fn new(templates_dir: impl Into<PathBuf>, running_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            running_dir: running_dir.into(),
        }
    }

    /// Template tree (also backing a static template's volume).
    pub fn template_dir(&self, template: &str) -> PathBuf {
        self.templates_dir.join(template)
    }

    /// Working directory of an instance.
    pub fn instance_dir(&self, internal_id: &str) -> PathBuf {
        self.running_dir.join(internal_id)
    }

    /// Absolute template tree path, as the engine needs for mounts.
    pub fn absolute_template_dir(&self, template: &str) -> Result<PathBuf> {
        Ok(std::path::absolute(self.template_dir(template))?)
    }

    /// Build `running/{internal_id}/` from the image, template and extra layers.
    ///
    /// Missing layers are skipped. Returns the absolute instance path.
    pub async fn materialize(
        &self,
        internal_id: &str,
        image: &str,
        template: &str,
        extra_directories: &[String],
    ) -> Result<PathBuf> {
        let mut layers = vec![
            self.templates_dir.join(IMAGES_DIR).join(image),
            self.template_dir(template),
        ];
        for extra in extra_directories {
            layers.push(self.templates_dir.join(relative_layer(extra)?));
        }

        let target = std::path::absolute(self.instance_dir(internal_id))?;
        let dest = target.clone();
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            std::fs::create_dir_all(&dest)?;
            let mut copied = 0;
            for layer in &layers {
                copied += copy_tree(layer, &dest)?;
            }
            Ok(copied)
        })
        .await
        .map_err(|e| RuntimeError::Workspace(format!("copy task failed: {}", e)))??;

        debug!(
            instance_id = %internal_id,
            path = %target.display(),
            files = copied,
            "Materialized working directory"
        );
        Ok(target)
    }

    /// Delete an instance's working directory. Missing directories are fine.
    pub async fn remove(&self, internal_id: &str) -> Result<()> {
        let dir = self.instance_dir(internal_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(instance_id = %internal_id, "Removed working directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every working directory. Returns the number removed.
    pub async fn sweep(&self) -> Result<u64> {
        let mut entries = match tokio::fs::read_dir(&self.running_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Running directory does not exist, nothing to sweep");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale entry"),
            }
        }

        if removed > 0 {
            info!(removed, "Swept stale working directories");
        }
        Ok(removed)
    }
}

/// Reject layer paths that escape the templates root.
fn relative_layer(path: &str) -> Result<&Path> {
    let path = Path::new(path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(RuntimeError::Workspace(format!(
            "extra directory must be relative to the templates root: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Copy `src` into `dest`, overwriting existing files. Returns files copied.
fn copy_tree(src: &Path, dest: &Path) -> Result<u64> {
    if !src.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| RuntimeError::Workspace(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RuntimeError::Workspace(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
