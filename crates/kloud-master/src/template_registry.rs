// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template & Image Registry
//!
//! Loads server templates and container images from JSON files once at
//! startup. Missing files are created with defaults. The registry is
//! read-only afterwards and is shared behind an `Arc`.
//!
//! Validation is all-or-nothing: duplicate names, templates referencing an
//! unknown image, proxy templates flagged as lobby and readiness patterns that
//! do not compile all reject the whole registry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use kloud_core::{BuildSettings, DynamicTemplate, Image, ServerKind, Template};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading or validating the registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Reading or writing a definitions file failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A definitions file is not valid JSON for its type.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Two templates share a name.
    #[error("Duplicate template name: {0}")]
    DuplicateTemplate(String),

    /// Two images share a name.
    #[error("Duplicate image name: {0}")]
    DuplicateImage(String),

    /// A template references an image that is not defined.
    #[error("Template {template} references unknown image {image}")]
    UnknownImage {
        /// Template name.
        template: String,
        /// Missing image name.
        image: String,
    },

    /// A proxy template is flagged as lobby.
    #[error("Proxy template {0} cannot be a lobby")]
    ProxyLobby(String),

    /// A readiness pattern is not a valid regular expression.
    #[error("Invalid started message pattern for image {image}: {source}")]
    InvalidPattern {
        /// Image name.
        image: String,
        /// Underlying error.
        source: regex::Error,
    },
}

/// Read-only lookup of templates and images.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
    images: BTreeMap<String, Image>,
}

impl TemplateRegistry {
    /// Load definitions from disk, writing defaults for missing files, and make
    /// sure a directory exists under `templates_dir` for every template.
    pub async fn load(
        templates_file: &Path,
        images_file: &Path,
        templates_dir: &Path,
    ) -> Result<Self, RegistryError> {
        let images = load_or_create(images_file, default_images).await?;
        let templates = load_or_create(templates_file, default_templates).await?;

        let registry = Self::from_parts(templates, images)?;
        registry.ensure_template_dirs(templates_dir).await?;

        info!(
            templates = registry.templates.len(),
            images = registry.images.len(),
            "Template registry loaded"
        );

        Ok(registry)
    }

    /// Build and validate a registry from in-memory definitions.
    pub fn from_parts(templates: Vec<Template>, images: Vec<Image>) -> Result<Self, RegistryError> {
        let mut image_map = BTreeMap::new();
        for image in images {
            Regex::new(&image.started_message_pattern).map_err(|source| {
                RegistryError::InvalidPattern {
                    image: image.name.clone(),
                    source,
                }
            })?;
            if image_map.contains_key(&image.name) {
                return Err(RegistryError::DuplicateImage(image.name));
            }
            image_map.insert(image.name.clone(), image);
        }

        let mut template_map = BTreeMap::new();
        for template in templates {
            if template_map.contains_key(&template.name) {
                return Err(RegistryError::DuplicateTemplate(template.name));
            }
            if !image_map.contains_key(&template.build.image) {
                return Err(RegistryError::UnknownImage {
                    template: template.name,
                    image: template.build.image,
                });
            }
            if template.kind.is_proxy() && template.lobby {
                return Err(RegistryError::ProxyLobby(template.name));
            }
            if template.is_dynamic() && template.forced_port.is_some() {
                warn!(
                    template = %template.name,
                    "forcedPort is ignored for dynamic templates"
                );
            }
            template_map.insert(template.name.clone(), template);
        }

        Ok(Self {
            templates: template_map,
            images: image_map,
        })
    }

    async fn ensure_template_dirs(&self, templates_dir: &Path) -> Result<(), RegistryError> {
        for name in self.templates.keys() {
            let dir = templates_dir.join(name);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| RegistryError::Io {
                    path: dir.clone(),
                    source,
                })?;
            info!(template = %name, path = %dir.display(), "Created template directory");
        }
        Ok(())
    }

    /// Template by name.
    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    /// All templates, ordered by name.
    pub fn list_templates(&self) -> Vec<&Template> {
        self.templates.values().collect()
    }

    /// Templates without scaling bounds.
    pub fn static_templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.values().filter(|t| t.is_static())
    }

    /// Dynamic templates in scale-up order: proxies first, then by descending
    /// priority.
    pub fn dynamic_templates(&self) -> Vec<&Template> {
        let mut dynamic: Vec<&Template> =
            self.templates.values().filter(|t| t.is_dynamic()).collect();
        dynamic.sort_by_key(|t| (!t.kind.is_proxy(), std::cmp::Reverse(t.priority)));
        dynamic
    }

    /// Image by name.
    pub fn get_image(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    /// All images, ordered by name.
    pub fn list_images(&self) -> Vec<&Image> {
        self.images.values().collect()
    }

    /// Image a template is built from.
    pub fn resolve_image(&self, template: &Template) -> Result<&Image, RegistryError> {
        self.images
            .get(&template.build.image)
            .ok_or_else(|| RegistryError::UnknownImage {
                template: template.name.clone(),
                image: template.build.image.clone(),
            })
    }
}

async fn load_or_create<T>(path: &Path, defaults: fn() -> Vec<T>) -> Result<Vec<T>, RegistryError>
where
    T: Serialize + DeserializeOwned,
{
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let values = defaults();
            let json = serde_json::to_string_pretty(&values).map_err(|source| {
                RegistryError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            tokio::fs::write(path, json)
                .await
                .map_err(|source| RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            warn!(path = %path.display(), "Definitions file not found, wrote defaults");
            Ok(values)
        }
        Err(source) => Err(RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Images written when `images.json` is absent.
pub fn default_images() -> Vec<Image> {
    vec![
        Image {
            name: "velocity".to_string(),
            image: "itzg/mc-proxy".to_string(),
            default_version: "latest".to_string(),
            default_internal_port: kloud_core::template::DEFAULT_INTERNAL_PORT,
            started_message_pattern: r"Done \(.*\)!".to_string(),
            environment: BTreeMap::from([("TYPE".to_string(), "VELOCITY".to_string())]),
        },
        Image {
            name: "paper".to_string(),
            image: "itzg/minecraft-server".to_string(),
            default_version: "latest".to_string(),
            default_internal_port: kloud_core::template::DEFAULT_INTERNAL_PORT,
            started_message_pattern: r#"Done \(.*\)! For help, type "help"$"#.to_string(),
            environment: BTreeMap::from([("TYPE".to_string(), "PAPER".to_string())]),
        },
    ]
}

/// Templates written when `templates.json` is absent.
pub fn default_templates() -> Vec<Template> {
    vec![
        Template {
            name: "proxy".to_string(),
            build: BuildSettings {
                image: "velocity".to_string(),
                version: None,
            },
            environment: BTreeMap::new(),
            lobby: false,
            kind: ServerKind::Proxy,
            required_permissions: vec![],
            priority: 0,
            dynamic: None,
            forced_port: None,
        },
        Template {
            name: "lobby".to_string(),
            build: BuildSettings {
                image: "paper".to_string(),
                version: None,
            },
            environment: BTreeMap::new(),
            lobby: true,
            kind: ServerKind::ProxiedServer,
            required_permissions: vec![],
            priority: 0,
            dynamic: Some(DynamicTemplate {
                min_instances: 1,
                max_instances: 1,
                extra_directories: vec![],
            }),
            forced_port: None,
        },
    ]
}

/// Group templates by image name, used to pull each image reference once.
pub(crate) fn references_by_image(registry: &TemplateRegistry) -> HashMap<String, Vec<String>> {
    let mut refs: HashMap<String, Vec<String>> = HashMap::new();
    for template in registry.templates.values() {
        let Some(image) = registry.images.get(&template.build.image) else {
            continue;
        };
        let reference = template.image_reference(image);
        let entry = refs.entry(image.name.clone()).or_default();
        if !entry.contains(&reference) {
            entry.push(reference);
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, image: &str) -> Template {
        Template {
            name: name.to_string(),
            build: BuildSettings {
                image: image.to_string(),
                version: None,
            },
            environment: BTreeMap::new(),
            lobby: false,
            kind: ServerKind::ProxiedServer,
            required_permissions: vec![],
            priority: 0,
            dynamic: None,
            forced_port: None,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let registry = TemplateRegistry::from_parts(default_templates(), default_images()).unwrap();
        assert!(registry.get_template("proxy").unwrap().is_static());
        assert!(registry.get_template("lobby").unwrap().lobby);
        assert_eq!(
            registry.get_image("paper").unwrap().image,
            "itzg/minecraft-server"
        );
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let err = TemplateRegistry::from_parts(
            vec![template("survival", "paper"), template("survival", "paper")],
            default_images(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTemplate(name) if name == "survival"));
    }

    #[test]
    fn test_duplicate_image_rejected() {
        let mut images = default_images();
        images.push(images[0].clone());
        let err = TemplateRegistry::from_parts(vec![], images).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateImage(name) if name == "velocity"));
    }

    #[test]
    fn test_unknown_image_rejected() {
        let err = TemplateRegistry::from_parts(vec![template("modded", "forge")], default_images())
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnknownImage { template, image } if template == "modded" && image == "forge"
        ));
    }

    #[test]
    fn test_proxy_lobby_rejected() {
        let mut proxy = template("proxy", "velocity");
        proxy.kind = ServerKind::Proxy;
        proxy.lobby = true;
        let err = TemplateRegistry::from_parts(vec![proxy], default_images()).unwrap_err();
        assert!(matches!(err, RegistryError::ProxyLobby(_)));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut images = default_images();
        images[1].started_message_pattern = "Done (".to_string();
        let err = TemplateRegistry::from_parts(vec![], images).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPattern { image, .. } if image == "paper"));
    }

    #[test]
    fn test_dynamic_templates_ordered_proxy_first_then_priority() {
        let dynamic = |name: &str, kind: ServerKind, priority: i32| {
            let mut t = template(name, "paper");
            t.kind = kind;
            t.priority = priority;
            t.dynamic = Some(DynamicTemplate {
                min_instances: 1,
                max_instances: 2,
                extra_directories: vec![],
            });
            t
        };

        let registry = TemplateRegistry::from_parts(
            vec![
                dynamic("bedwars", ServerKind::ProxiedServer, 1),
                dynamic("skywars", ServerKind::ProxiedServer, 5),
                dynamic("edge", ServerKind::Proxy, 0),
                template("survival", "paper"),
            ],
            default_images(),
        )
        .unwrap();

        let order: Vec<&str> = registry
            .dynamic_templates()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(order, ["edge", "skywars", "bedwars"]);
        assert_eq!(registry.static_templates().count(), 1);
    }

    #[tokio::test]
    async fn test_load_writes_defaults_and_template_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let templates_file = dir.path().join("templates.json");
        let images_file = dir.path().join("images.json");
        let templates_dir = dir.path().join("templates");

        let registry = TemplateRegistry::load(&templates_file, &images_file, &templates_dir)
            .await
            .unwrap();

        assert_eq!(registry.list_templates().len(), 2);
        assert!(templates_file.exists());
        assert!(images_file.exists());
        assert!(templates_dir.join("proxy").is_dir());
        assert!(templates_dir.join("lobby").is_dir());

        // Second load reads the files that were just written.
        let reloaded = TemplateRegistry::load(&templates_file, &images_file, &templates_dir)
            .await
            .unwrap();
        assert_eq!(
            reloaded.get_template("lobby"),
            registry.get_template("lobby")
        );
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let templates_file = dir.path().join("templates.json");
        let images_file = dir.path().join("images.json");
        tokio::fs::write(&templates_file, "[{\"name\": ").await.unwrap();

        let err = TemplateRegistry::load(&templates_file, &images_file, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[test]
    fn test_references_grouped_per_image() {
        let mut pinned = template("modern", "paper");
        pinned.build.version = Some("java21".to_string());
        let registry = TemplateRegistry::from_parts(
            vec![template("a", "paper"), template("b", "paper"), pinned],
            default_images(),
        )
        .unwrap();

        let refs = references_by_image(&registry);
        assert_eq!(
            refs["paper"],
            [
                "itzg/minecraft-server:latest".to_string(),
                "itzg/minecraft-server:java21".to_string()
            ]
        );
        assert!(!refs.contains_key("velocity"));
    }
}
