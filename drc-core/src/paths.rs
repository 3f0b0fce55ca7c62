// ABOUTME: XDG Base Directory paths for drc configuration and logs.
// ABOUTME: Falls back to the working directory when no home directory can be determined.

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "org";
const ORGANIZATION: &str = "drc";
const APPLICATION: &str = "drc";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// e.g. ~/.local/share/drc/
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// e.g. ~/.local/share/drc/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// e.g. ~/.config/drc/
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
