// src/infra/paths.rs — Config and data locations
//
// All paths respect the PROMPTLOOP_HOME environment variable for isolation.
// When unset, config lives in ~/.promptloop/ and data in XDG_DATA_HOME/promptloop.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

fn promptloop_home() -> Option<PathBuf> {
    std::env::var_os("PROMPTLOOP_HOME").map(PathBuf::from)
}

/// Configuration directory: $PROMPTLOOP_HOME/ or ~/.promptloop/
pub fn config_dir() -> PathBuf {
    if let Some(home) = promptloop_home() {
        return home;
    }
    BaseDirs::new()
        .map(|b| b.home_dir().join(".promptloop"))
        .unwrap_or_else(|| PathBuf::from(".promptloop"))
}

/// Data directory: $PROMPTLOOP_HOME/data/ or the platform data dir.
pub fn data_dir() -> PathBuf {
    if let Some(home) = promptloop_home() {
        return home.join("data");
    }
    ProjectDirs::from("", "", "promptloop")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| config_dir().join("data"))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn db_path() -> PathBuf {
    data_dir().join("promptloop.db")
}

