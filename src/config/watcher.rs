//! Configuration file watcher for hot-reload support
//!
//! notify reports raw file events on its own thread. They are funnelled into
//! a reload task that waits for a burst to settle, parses the file once and
//! hands the result to the app loop. A file that fails to parse is reported
//! and skipped; the running settings stay in place until the next good save.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period after the last file event before reloading
const SETTLE: Duration = Duration::from_millis(100);

/// Delivers a fresh [`AppConfig`] each time the file is saved
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Start watching `config_path`
    ///
    /// A missing file is created with the defaults so there is something to
    /// watch and edit. The current contents are not loaded here.
    pub async fn start(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            info!("No config at {}, writing defaults", config_path);
            AppConfig::default().save(config_path).await?;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches_contents(&event.kind) => {
                debug!("Config file event: {:?}", event.paths);
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(e) => error!("Config watch error: {}", e),
        })?;

        watcher
            .watch(Path::new(config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        let (tx, rx) = mpsc::channel(10);
        tokio::spawn(reload_loop(config_path.to_string(), event_rx, tx));

        info!("Config file watcher started for: {}", config_path);
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next successfully parsed config
    ///
    /// Returns None once the watcher is gone.
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

fn touches_contents(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Create(_))
}

/// Turn bursts of file events into one reload each
///
/// Ends when the notify watcher (and with it the event sender) is dropped,
/// or when nobody listens for configs any more.
async fn reload_loop(
    path: String,
    mut events: mpsc::UnboundedReceiver<()>,
    configs: mpsc::Sender<AppConfig>,
) {
    while events.recv().await.is_some() {
        loop {
            match tokio::time::timeout(SETTLE, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        match AppConfig::load(&path).await {
            Ok(config) => {
                info!("Configuration reloaded");
                if configs.send(config).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Config reload failed, keeping current settings: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn next(watcher: &mut ConfigWatcher) -> Option<AppConfig> {
        tokio::time::timeout(Duration::from_secs(2), watcher.next_config())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_config_watcher_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "sync:\n  debounce_ms: 250\n")?;

        let mut watcher = ConfigWatcher::start(&config_path.to_string_lossy()).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, "sync:\n  debounce_ms: 400\n")?;

        if let Some(new_config) = next(&mut watcher).await {
            assert_eq!(new_config.sync.debounce_ms, 400);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_burst_of_writes_loads_final_contents() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "")?;

        let mut watcher = ConfigWatcher::start(&config_path.to_string_lossy()).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        for ms in [310, 320, 330] {
            fs::write(&config_path, format!("sync:\n  debounce_ms: {}\n", ms))?;
        }

        if let Some(new_config) = next(&mut watcher).await {
            assert_eq!(new_config.sync.debounce_ms, 330);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_file_keeps_watching() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "sync: [not, a, map]\n")?;

        // A broken file does not stop the watcher from starting
        let mut watcher = ConfigWatcher::start(&config_path.to_string_lossy()).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, "sync:\n  max_attempts: 5\n")?;

        if let Some(new_config) = next(&mut watcher).await {
            assert_eq!(new_config.sync.max_attempts, 5);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_config_is_created() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("fresh.yaml");

        let _watcher = ConfigWatcher::start(&config_path.to_string_lossy()).await?;
        assert!(config_path.exists());
        assert_eq!(AppConfig::load(&config_path.to_string_lossy()).await?, AppConfig::default());
        Ok(())
    }
}
