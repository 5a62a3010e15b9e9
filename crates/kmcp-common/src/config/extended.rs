//! Name-keyed registries for provider and toolset tables
//!
//! Tables under `[cluster_provider_configs.<name>]` and
//! `[toolset_configs.<name>]` decode in two phases: first as raw TOML, then
//! through the parser registered for `<name>`. Unregistered names are
//! ignored so newer config files keep loading on older builds.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Context handed to every extended-config parser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseContext {
    /// Absolute directory of the file the table came from
    pub config_dir: Option<PathBuf>,
}

impl ParseContext {
    /// Context rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(dir.into()),
        }
    }

    /// Resolve a possibly relative path against the config directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        match &self.config_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }
}

/// A typed provider or toolset configuration
pub trait ExtendedConfig: Any + fmt::Debug + Send + Sync {
    /// Check semantic constraints after decoding
    fn validate(&self) -> std::result::Result<(), String>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;
}

/// Parser turning a raw table into a typed config
pub type ExtendedConfigParser =
    fn(&ParseContext, toml::Value) -> std::result::Result<Arc<dyn ExtendedConfig>, String>;

/// Decode a raw table into `T`
pub fn decode<T: DeserializeOwned>(value: toml::Value) -> std::result::Result<T, String> {
    value.try_into().map_err(|e: toml::de::Error| e.message().to_string())
}

/// Registry of parsers for one table namespace
#[derive(Clone)]
pub struct ExtendedConfigRegistry {
    kind: &'static str,
    parsers: HashMap<String, ExtendedConfigParser>,
}

impl ExtendedConfigRegistry {
    /// Empty registry for the given namespace kind ("provider", "toolset")
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            parsers: HashMap::new(),
        }
    }

    /// Register a parser
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register(&mut self, name: &str, parser: ExtendedConfigParser) {
        if self.parsers.contains_key(name) {
            panic!("{} config parser {name:?} is already registered", self.kind);
        }
        self.parsers.insert(name.to_string(), parser);
    }

    /// Whether a parser exists for `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.parsers.contains_key(name)
    }

    /// Parse and validate every table with a registered parser
    ///
    /// Stops at the first failure, reporting the table name.
    pub fn parse(
        &self,
        ctx: &ParseContext,
        raw: &BTreeMap<String, toml::Value>,
    ) -> Result<HashMap<String, Arc<dyn ExtendedConfig>>> {
        let mut parsed = HashMap::new();
        for (name, value) in raw {
            let Some(parser) = self.parsers.get(name) else {
                debug!(kind = self.kind, name = %name, "Ignoring unregistered config table");
                continue;
            };
            let config = parser(ctx, value.clone()).map_err(|message| self.error(name, message))?;
            config.validate().map_err(|message| self.error(name, message))?;
            parsed.insert(name.clone(), config);
        }
        Ok(parsed)
    }

    fn error(&self, name: &str, message: String) -> Error {
        Error::ExtendedConfig {
            kind: self.kind.to_string(),
            name: name.to_string(),
            message,
        }
    }
}

impl fmt::Debug for ExtendedConfigRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.parsers.keys().collect();
        names.sort();
        f.debug_struct("ExtendedConfigRegistry")
            .field("kind", &self.kind)
            .field("parsers", &names)
            .finish()
    }
}

/// The two registries consulted while loading configuration
#[derive(Debug, Clone)]
pub struct ConfigRegistries {
    /// Parsers for `[cluster_provider_configs.<strategy>]`
    pub providers: ExtendedConfigRegistry,
    /// Parsers for `[toolset_configs.<name>]`
    pub toolsets: ExtendedConfigRegistry,
}

impl Default for ConfigRegistries {
    /// Registries with the built-in toolset parsers installed
    fn default() -> Self {
        let mut toolsets = ExtendedConfigRegistry::new("toolset");
        toolsets.register(super::KIALI_TOOLSET, super::kiali::parse);
        Self {
            providers: ExtendedConfigRegistry::new("provider"),
            toolsets,
        }
    }
}
