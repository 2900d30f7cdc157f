//! Application path management
//!
//! - **Development**: debug builds use `config.yaml` from the working
//!   directory when one is present.
//! - **Portable**: a `.portable` marker next to the executable keeps config
//!   and logs beside it.
//! - **Installed** (default): the platform config directory, e.g.
//!   `~/.config/yocto-sync` or `%APPDATA%\yocto-sync`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

/// Directory name used in installed mode
const APP_NAME: &str = "yocto-sync";

const CONFIG_FILE: &str = "config.yaml";

/// Where the config file and logs live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config: PathBuf,
    pub logs_dir: PathBuf,
    pub is_portable: bool,
}

impl AppPaths {
    /// Lay out paths beneath a single base directory
    pub fn in_dir(base: &Path, is_portable: bool) -> Self {
        Self {
            config: base.join(CONFIG_FILE),
            logs_dir: base.join("logs"),
            is_portable,
        }
    }

    /// Detect the appropriate paths based on environment
    ///
    /// Runs before logging is initialized, so diagnostics go to stderr.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join(CONFIG_FILE).exists() {
                eprintln!("[paths] DEV mode, using {}", cwd.display());
                return Self::in_dir(&cwd, true);
            }
        }

        if exe_dir.join(".portable").exists() {
            return Self::in_dir(&exe_dir, true);
        }

        let base = dirs::config_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] WARNING: no config directory, falling back to exe dir");
                exe_dir.clone()
            })
            .join(APP_NAME);
        Self::in_dir(&base, false)
    }

    /// Detected paths, with the config file replaced by `--config` if given
    pub fn resolve(config_override: Option<&str>) -> Self {
        let mut paths = Self::detect();
        if let Some(config) = config_override {
            paths.config = PathBuf::from(config);
        }
        paths
    }

    pub fn config_str(&self) -> String {
        self.config.to_string_lossy().to_string()
    }

    /// Create the logs directory
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if !self.logs_dir.exists() {
            debug!("Creating logs directory: {}", self.logs_dir.display());
            std::fs::create_dir_all(&self.logs_dir).with_context(|| {
                format!("Failed to create logs directory: {}", self.logs_dir.display())
            })?;
        }
        Ok(())
    }
}
