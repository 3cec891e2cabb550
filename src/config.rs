use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::report_export::ReportLayout;
use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "driving-exams.toml";
pub const DEFAULT_DB_RELATIVE_PATH: &str = "data/driving_exams.db";
pub const DB_PATH_ENV: &str = "DRIVING_EXAMS_DB";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: Option<String>,
    pub report: ReportLayout,
}

/// Loads the settings file. An explicitly named file must exist; the default one is
/// optional.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    if !path.exists() {
        if required {
            return Err(Error::Config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }
        return Ok(AppConfig::default());
    }

    let contents = std::fs::read_to_string(&path)?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("invalid settings file {}: {e}", path.display())))
}

/// Database location: command-line flag, then environment, then settings file, then
/// the default relative path.
pub fn resolve_db_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    config: &AppConfig,
) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    let from_env = env_value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(path) = from_env {
        return PathBuf::from(path);
    }
    config
        .database
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_RELATIVE_PATH))
}
