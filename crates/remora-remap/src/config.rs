//! Engine configuration (remora.toml)
//!
//! The configuration is a small TOML document; every field except the
//! internal prefix has a default. Environment variables can overlay the
//! dump directory and the prefix.

use remora_classfile::descriptor::array_element_class;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming the debug-dump directory
pub const DUMP_ENV: &str = "REMORA_DUMP";

/// Environment variable naming the internal namespace prefix
pub const PREFIX_ENV: &str = "REMORA_INTERNAL_PREFIX";

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Which half of the mapping table the rewriter applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Internal names become public names
    #[default]
    ToPublic,
    /// Public names become internal names
    ToInternal,
}

impl Direction {
    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToPublic => Direction::ToInternal,
            Direction::ToInternal => Direction::ToPublic,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToPublic => write!(f, "to-public"),
            Direction::ToInternal => write!(f, "to-internal"),
        }
    }
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to-public" => Ok(Direction::ToPublic),
            "to-internal" => Ok(Direction::ToInternal),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown direction: {}. Expected to-public or to-internal",
                other
            ))),
        }
    }
}

/// Remapping engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemapConfig {
    /// Lexical prefix of the internal namespace, e.g. `net/minecraft/`
    pub internal_prefix: String,

    /// Mapping direction applied by the rewriter
    #[serde(default)]
    pub direction: Direction,

    /// Directory receiving a copy of every rewritten class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_dir: Option<PathBuf>,

    /// Recompute stack map frames after rewriting
    #[serde(default = "default_true")]
    pub compute_frames: bool,

    /// Internal name of the reflection bridge template
    #[serde(default = "default_bridge_template")]
    pub bridge_template: String,

    /// Register every rewritten input in the runtime repository
    #[serde(default = "default_true")]
    pub register_runtime_classes: bool,

    /// Packages provided by the host platform
    #[serde(default = "default_platform_prefixes")]
    pub platform_prefixes: Vec<String>,

    /// Archives or directories holding the platform classes; when empty the
    /// JDK below `JAVA_HOME` is used
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform_classpath: Vec<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_bridge_template() -> String {
    "remora/bridge/ReflectionBridge".to_string()
}

fn default_platform_prefixes() -> Vec<String> {
    ["java/", "javax/", "jdk/", "sun/", "com/sun/"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl RemapConfig {
    /// Configuration with defaults for everything but the prefix
    pub fn new(internal_prefix: impl Into<String>) -> Self {
        Self {
            internal_prefix: internal_prefix.into(),
            direction: Direction::default(),
            dump_dir: None,
            compute_frames: true,
            bridge_template: default_bridge_template(),
            register_runtime_classes: true,
            platform_prefixes: default_platform_prefixes(),
            platform_classpath: Vec::new(),
        }
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RemapConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from the environment alone
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay environment variables onto this configuration
    pub fn overlay_env(&mut self) {
        self.overlay(|key| std::env::var(key).ok());
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let prefix = lookup(PREFIX_ENV).ok_or_else(|| ConfigError::MissingField(PREFIX_ENV.to_string()))?;
        let mut config = Self::new(prefix);
        config.overlay(lookup);
        config.validate()?;
        Ok(config)
    }

    fn overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(prefix) = lookup(PREFIX_ENV) {
            self.internal_prefix = prefix;
        }
        if let Some(dump) = lookup(DUMP_ENV).filter(|d| !d.is_empty()) {
            self.dump_dir = Some(PathBuf::from(dump));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.internal_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "Internal prefix cannot be empty".to_string(),
            ));
        }
        if !self.internal_prefix.ends_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid internal prefix: {}. Must be a package prefix ending in '/'",
                self.internal_prefix
            )));
        }
        if self.bridge_template.is_empty() || self.bridge_template.contains('.') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid bridge template name: {}. Must be an internal name like a/b/Name",
                self.bridge_template
            )));
        }
        if let Some(prefix) = self.platform_prefixes.iter().find(|p| !p.ends_with('/')) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid platform prefix: {}. Must end in '/'",
                prefix
            )));
        }
        Ok(())
    }

    /// Write the configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Namespace rules derived from this configuration
    pub fn namespace(&self) -> Namespace {
        Namespace {
            internal_prefix: self.internal_prefix.clone(),
            platform_prefixes: self.platform_prefixes.clone(),
        }
    }
}

/// Classification of class names into internal, platform and other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    internal_prefix: String,
    platform_prefixes: Vec<String>,
}

impl Namespace {
    /// Namespace with the default platform prefixes
    pub fn new(internal_prefix: impl Into<String>) -> Self {
        RemapConfig::new(internal_prefix).namespace()
    }

    /// The internal namespace prefix
    pub fn internal_prefix(&self) -> &str {
        &self.internal_prefix
    }

    /// Whether a class (or array of it) lives in the internal namespace
    pub fn is_internal(&self, name: &str) -> bool {
        element_class(name).map_or(false, |n| n.starts_with(&self.internal_prefix))
    }

    /// Whether a class is provided by the host platform
    ///
    /// Arrays of primitives count as platform types.
    pub fn is_platform(&self, name: &str) -> bool {
        match element_class(name) {
            Some(element) => self.platform_prefixes.iter().any(|p| element.starts_with(p.as_str())),
            None => true,
        }
    }
}

/// Element class of an array name, or the name itself
///
/// Returns `None` for arrays of primitives.
pub fn element_class(name: &str) -> Option<&str> {
    if name.starts_with('[') {
        array_element_class(name)
    } else {
        Some(name)
    }
}
