//! `converge.toml` loading.
//!
//! Every key is optional. A missing default file means default settings;
//! a missing file given explicitly is an error.

use crate::cli::ShowFormat;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "converge.toml";

/// Default location: `<config dir>/converge/converge.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("converge").join(CONFIG_FILE))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Colored output
    pub color: bool,
    pub show: ShowConfig,
    pub replay: ReplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            color: true,
            show: ShowConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShowConfig {
    pub format: ShowFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Verify after every entry even without `--check-prefixes`
    pub check_prefixes: bool,
}

impl Config {
    /// Load `explicit`, or the default file when it exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Invalid {CONFIG_FILE} format in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.color);
        assert_eq!(config.show.format, ShowFormat::Tree);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: Config = toml::from_str(
            r#"
color = false

[show]
format = "json"

[replay]
check_prefixes = true
"#,
        )
        .unwrap();
        assert!(!config.color);
        assert_eq!(config.show.format, ShowFormat::Json);
        assert!(config.replay.check_prefixes);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(toml::from_str::<Config>("colour = true").is_err());
    }

    #[test]
    fn test_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[replay]\ncheck_prefixes = true\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(config.replay.check_prefixes);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Could not read"));
    }
}
