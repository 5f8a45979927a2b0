// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the `gg-deploy` binary.
//!
//! ## Usage
//!
//! ```bash
//! gg-deploy plan deployment.json      # Print the deploy plan
//! gg-deploy inspect model.ggm         # Parse a model container
//! gg-deploy pack models.json out.ggm  # Write a model container
//! gg-deploy deploy deployment.json    # Deploy on an in-process cluster
//! gg-deploy config show               # Effective configuration
//! ```

pub mod config_cmd;
pub mod deploy_cmd;
pub mod inspect_cmd;
pub mod pack_cmd;
pub mod plan_cmd;

use std::path::{Path, PathBuf};

use crate::config::{self, ConfigError, DeployConfig};

/// Environment variable naming a TOML config file.
pub const CONFIG_PATH_ENV: &str = "GG_DEPLOY_CONFIG";

/// Config file path from the environment, if any.
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load the file named by [`CONFIG_PATH_ENV`] if set, else environment only.
pub fn load_config() -> Result<DeployConfig, ConfigError> {
    match config_path() {
        Some(path) => config::load_file(&path),
        None => Ok(config::load()),
    }
}

/// Directory manifest-relative artifact paths resolve against.
pub(crate) fn base_dir(manifest: &Path) -> PathBuf {
    manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_of_bare_file_is_cwd() {
        assert_eq!(base_dir(Path::new("deploy.json")), PathBuf::from(""));
        assert_eq!(base_dir(Path::new("/srv/a/deploy.json")), PathBuf::from("/srv/a"));
    }
}
