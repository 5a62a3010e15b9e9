//! Layered configuration loading
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults, or the override config when one is supplied
//! 2. the main TOML file
//! 3. `*.toml` drop-ins from a directory, in lexical file-name order
//!
//! Layers are deep-merged as TOML tables, so a later layer only replaces
//! the keys it sets. Arrays are replaced wholesale.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::extended::{ConfigRegistries, ParseContext};
use super::StaticConfig;
use crate::error::{Error, Result};

/// Builds a [`StaticConfig`] from defaults, files and drop-ins
#[derive(Debug)]
pub struct Loader<'a> {
    registries: &'a ConfigRegistries,
    overrides: Option<StaticConfig>,
}

impl<'a> Loader<'a> {
    /// Loader resolving extended tables through `registries`
    pub fn new(registries: &'a ConfigRegistries) -> Self {
        Self {
            registries,
            overrides: None,
        }
    }

    /// Replace the built-in defaults with a build-time override config
    pub fn with_overrides(mut self, overrides: StaticConfig) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Load the main file and the drop-in directory
    ///
    /// Either may be omitted. A drop-in directory that does not exist is
    /// skipped.
    pub fn read(&self, config: Option<&Path>, drop_in_dir: Option<&Path>) -> Result<StaticConfig> {
        let mut merged = self.base()?;

        if let Some(path) = config {
            let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            merge(&mut merged, parse_document(&path.display().to_string(), &content)?);
            debug!(path = %path.display(), "Loaded main config");
        }

        if let Some(dir) = drop_in_dir {
            for file in drop_in_files(dir)? {
                let content = fs::read_to_string(&file).map_err(|e| Error::io(&file, e))?;
                merge(&mut merged, parse_document(&file.display().to_string(), &content)?);
                debug!(path = %file.display(), "Applied config drop-in");
            }
        }

        let ctx = ParseContext {
            config_dir: config
                .map(parent_dir)
                .or(drop_in_dir.map(Path::to_path_buf))
                .map(absolute),
        };
        let config = self.finish(merged, &ctx)?;
        info!(
            strategy = config.cluster_provider_strategy.as_deref().unwrap_or("auto"),
            denied = config.denied_resources.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load a single TOML document on top of the defaults
    pub fn read_toml(&self, content: &str) -> Result<StaticConfig> {
        let mut merged = self.base()?;
        merge(&mut merged, parse_document("inline", content)?);
        self.finish(merged, &ParseContext::default())
    }

    fn base(&self) -> Result<toml::Value> {
        let base = self.overrides.clone().unwrap_or_default();
        toml::Value::try_from(&base).map_err(|e| Error::parse("overrides", e))
    }

    fn finish(&self, merged: toml::Value, ctx: &ParseContext) -> Result<StaticConfig> {
        let mut config: StaticConfig = merged
            .try_into()
            .map_err(|e: toml::de::Error| Error::parse("merged config", e.message()))?;
        config.resolve_extended(self.registries, ctx)?;
        Ok(config)
    }
}

fn parse_document(origin: &str, content: &str) -> Result<toml::Value> {
    let table: toml::Table = toml::from_str(content).map_err(|e| Error::parse(origin, e))?;
    Ok(toml::Value::Table(table))
}

/// Deep-merge `overlay` into `base`; tables merge key by key, anything else is replaced
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// `*.toml` files in `dir`, sorted, dotfiles skipped
fn drop_in_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Drop-in directory does not exist");
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".toml") || !path.is_file() {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupVersionKind, KialiConfig, KIALI_TOOLSET};

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn read_main_file_equals_read_toml() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        let content = r#"
            read_only = true
            cluster_provider_strategy = "kubeconfig"
            denied_resources = [{ version = "v1", kind = "Secret" }]
        "#;
        let path = write(dir.path(), "config.toml", content);

        let from_file = loader.read(Some(&path), None).unwrap();
        let inline = loader.read_toml(content).unwrap();

        assert_eq!(from_file.read_only, inline.read_only);
        assert_eq!(
            from_file.cluster_provider_strategy,
            inline.cluster_provider_strategy
        );
        assert_eq!(from_file.denied_resources, inline.denied_resources);
        assert_eq!(
            inline.denied_resources,
            vec![GroupVersionKind::new("", "v1", "Secret")]
        );
    }

    #[test]
    fn later_drop_in_wins() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10-a.toml", "port = \"8080\"\n");
        write(dir.path(), "20-b.toml", "port = \"9090\"\n");

        let config = loader.read(None, Some(dir.path())).unwrap();
        assert_eq!(config.port.as_deref(), Some("9090"));

        let reordered = tempfile::tempdir().unwrap();
        write(reordered.path(), "10-b.toml", "port = \"9090\"\n");
        write(reordered.path(), "20-a.toml", "port = \"8080\"\n");

        let config = loader.read(None, Some(reordered.path())).unwrap();
        assert_eq!(config.port.as_deref(), Some("8080"));
    }

    #[test]
    fn unset_keys_keep_earlier_values() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        let main = write(dir.path(), "config.toml", "read_only = true\nport = \"8080\"\n");
        let drop_ins = dir.path().join("conf.d");
        fs::create_dir(&drop_ins).unwrap();
        write(&drop_ins, "10-port.toml", "port = \"9090\"\n");

        let config = loader.read(Some(&main), Some(&drop_ins)).unwrap();
        assert!(config.read_only);
        assert_eq!(config.port.as_deref(), Some("9090"));
        assert_eq!(config.toolsets, vec!["core", "config", "helm"]);
    }

    #[test]
    fn nested_tables_merge_per_key() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "10-kiali.toml",
            "[toolset_configs.kiali]\nurl = \"https://kiali.example.com\"\n",
        );
        write(
            dir.path(),
            "20-kiali-tls.toml",
            "[toolset_configs.kiali]\ninsecure = true\n",
        );

        let config = loader.read(None, Some(dir.path())).unwrap();
        let kiali = config.toolset_config::<KialiConfig>(KIALI_TOOLSET).unwrap();
        assert_eq!(kiali.url, "https://kiali.example.com");
        assert!(kiali.insecure);
    }

    #[test]
    fn skips_dotfiles_and_other_extensions() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10-base.toml", "port = \"8080\"\n");
        write(dir.path(), ".20-hidden.toml", "port = \"1111\"\n");
        write(dir.path(), "30-notes.txt", "port = \"2222\"\n");
        write(dir.path(), "40-backup.toml.bak", "port = \"3333\"\n");

        let config = loader.read(None, Some(dir.path())).unwrap();
        assert_eq!(config.port.as_deref(), Some("8080"));
    }

    #[test]
    fn drop_in_only_resolves_paths_against_drop_in_dir() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "kiali.toml",
            "[toolset_configs.kiali]\nurl = \"https://kiali\"\ncertificate_authority = \"ca.pem\"\n",
        );

        let config = loader.read(None, Some(dir.path())).unwrap();
        let kiali = config.toolset_config::<KialiConfig>(KIALI_TOOLSET).unwrap();
        let expected = std::path::absolute(dir.path().join("ca.pem")).unwrap();
        assert_eq!(
            kiali.certificate_authority.as_deref(),
            Some(expected.display().to_string().as_str())
        );
    }

    #[test]
    fn overrides_replace_defaults_but_not_files() {
        let registries = ConfigRegistries::default();
        let overrides = StaticConfig {
            read_only: true,
            port: Some("7000".to_string()),
            ..Default::default()
        };
        let loader = Loader::new(&registries).with_overrides(overrides);

        let config = loader.read_toml("port = \"8000\"\n").unwrap();
        assert!(config.read_only);
        assert_eq!(config.port.as_deref(), Some("8000"));
    }

    #[test]
    fn missing_drop_in_dir_is_ignored() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        let config = loader
            .read(None, Some(&dir.path().join("does-not-exist")))
            .unwrap();
        assert!(!config.read_only);
    }

    #[test]
    fn malformed_toml_reports_file() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "broken.toml", "read_only = \n");

        let err = loader.read(Some(&path), None).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn invalid_extended_table_fails_load() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let err = loader
            .read_toml("[toolset_configs.kiali]\ninsecure = true\n")
            .unwrap_err();
        assert!(matches!(err, Error::ExtendedConfig { .. }));
    }

    #[test]
    fn unknown_extended_tables_are_ignored() {
        let registries = ConfigRegistries::default();
        let loader = Loader::new(&registries);
        let config = loader
            .read_toml("[toolset_configs.future]\nenabled = true\n")
            .unwrap();
        assert!(config.toolset_configs.contains_key("future"));
    }
}
