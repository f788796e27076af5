//! Host configuration for Moorage
//!
//! Parses `moorage.toml` using serde. A missing file yields the built-in
//! defaults so a fresh host works with a single `zroot/moorage` source.

use crate::error::{Error, Result};
use crate::resource::selector::is_valid_name;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the host configuration
pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/moorage.toml";

/// Load configuration from a file, falling back to defaults when absent
pub fn load(path: &Path) -> Result<MoorageConfig> {
    if !path.exists() {
        tracing::debug!("config {} not found, using defaults", path.display());
        let config = MoorageConfig::default();
        config.validate()?;
        return Ok(config);
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: MoorageConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct MoorageConfig {
    /// Backing sources, the first one is the primary source
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceDef>,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolPaths,

    /// Release mirror settings
    #[serde(default)]
    pub releases: ReleaseConfig,

    /// Retry/backoff configuration for HTTP operations
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for MoorageConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            tools: ToolPaths::default(),
            releases: ReleaseConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MoorageConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::ConfigValidation(
                "At least one source must be configured".into(),
            ));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !is_valid_name(&source.name) {
                return Err(Error::ConfigValidation(format!(
                    "Invalid source name: {}",
                    source.name
                )));
            }
            if !names.insert(source.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
            if source.dataset.is_empty() || source.dataset.starts_with('/') {
                return Err(Error::ConfigValidation(format!(
                    "Source '{}' needs a dataset name like 'zroot/moorage'",
                    source.name
                )));
            }
        }

        if self.releases.archives.is_empty() {
            return Err(Error::ConfigValidation(
                "releases.archives must name at least one archive".into(),
            ));
        }

        Ok(())
    }
}

/// A backing dataset jails and releases live on
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceDef {
    /// Short name used in `source/name` selectors
    pub name: String,
    /// ZFS dataset holding `jails/` and `releases/`
    pub dataset: String,
}

impl SourceDef {
    /// Mountpoint of the source dataset
    pub fn mountpoint(&self) -> PathBuf {
        PathBuf::from(format!("/{}", self.dataset))
    }
}

fn default_sources() -> Vec<SourceDef> {
    vec![SourceDef {
        name: "zroot".into(),
        dataset: "zroot/moorage".into(),
    }]
}

/// Paths of the system tools Moorage drives
#[derive(Debug, Clone, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_status_tool")]
    pub status: PathBuf,
    #[serde(default = "default_jail_tool")]
    pub jail: PathBuf,
    #[serde(default = "default_jexec_tool")]
    pub jexec: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            status: default_status_tool(),
            jail: default_jail_tool(),
            jexec: default_jexec_tool(),
        }
    }
}

fn default_status_tool() -> PathBuf {
    PathBuf::from("/usr/sbin/jls")
}

fn default_jail_tool() -> PathBuf {
    PathBuf::from("/usr/sbin/jail")
}

fn default_jexec_tool() -> PathBuf {
    PathBuf::from("/usr/sbin/jexec")
}

/// Release mirror configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// FreeBSD mirror URL
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,

    /// Archives to fetch (base, lib32, src)
    #[serde(default = "default_archives")]
    pub archives: Vec<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            mirror_url: default_mirror_url(),
            archives: default_archives(),
        }
    }
}

fn default_mirror_url() -> String {
    "https://download.freebsd.org/releases".into()
}

fn default_archives() -> Vec<String> {
    vec!["base".into()]
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    5
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for HTTP operations
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sources[0].name, "zroot");
        assert_eq!(config.tools.status, PathBuf::from("/usr/sbin/jls"));
        assert_eq!(config.releases.archives, vec!["base"]);
    }

    #[test]
    fn test_parse_multiple_sources() {
        let toml = r#"
[[sources]]
name = "fast"
dataset = "nvme/moorage"

[[sources]]
name = "bulk"
dataset = "tank/moorage"

[tools]
status = "/opt/bin/jls"

[retry]
max_attempts = 2
"#;

        let config: MoorageConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources[0].name, "fast");
        assert_eq!(config.sources[1].mountpoint(), PathBuf::from("/tank/moorage"));
        assert_eq!(config.tools.status, PathBuf::from("/opt/bin/jls"));
        assert_eq!(config.tools.jail, PathBuf::from("/usr/sbin/jail"));
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn test_duplicate_source_error() {
        let toml = r#"
[[sources]]
name = "main"
dataset = "zroot/a"

[[sources]]
name = "main"
dataset = "zroot/b"
"#;

        let config: MoorageConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_source_name_error() {
        let toml = r#"
[[sources]]
name = "bad/name"
dataset = "zroot/a"
"#;

        let config: MoorageConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moorage.toml");
        fs::write(&path, "[[sources]]\nname = \"main\"\ndataset = \"zroot/jails\"\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].dataset, "zroot/jails");
    }
}
