//! Admission knobs, shared and hot-reloadable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid admission config in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{} has no file name", .0.display())]
    NotAFile(PathBuf),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tick, load and send radii. Negative means "use the fallback".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewDistances {
    pub tick: i32,
    pub load: i32,
    pub send: i32,
}

impl ViewDistances {
    /// Every radius deferred to the fallback.
    pub const UNSET: Self = Self {
        tick: -1,
        load: -1,
        send: -1,
    };

    #[must_use]
    pub const fn new(tick: i32, load: i32, send: i32) -> Self {
        Self { tick, load, send }
    }
}

impl Default for ViewDistances {
    fn default() -> Self {
        Self::UNSET
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Loads in flight per consumer. 0 derives from the load radius,
    /// negative is unlimited.
    pub max_concurrent_loads: i64,
    /// Generations in flight per consumer, same encoding as loads.
    pub max_concurrent_generations: i64,
    /// Admissions per second. Zero or negative means unlimited.
    pub max_load_rate: f64,
    pub max_generate_rate: f64,
    pub max_send_rate: f64,
    /// Used for any radius a consumer leaves unset.
    pub world: ViewDistances,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 0,
            max_concurrent_generations: 0,
            max_load_rate: -1.0,
            max_generate_rate: -1.0,
            max_send_rate: -1.0,
            world: ViewDistances::new(10, 10, -1),
        }
    }
}

impl AdmissionConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Shared config read by every controller each tick.
#[derive(Clone, Debug, Default)]
pub struct ConfigHandle(Arc<RwLock<AdmissionConfig>>);

impl ConfigHandle {
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    #[must_use]
    pub fn get(&self) -> AdmissionConfig {
        self.0.read().clone()
    }

    pub fn set(&self, config: AdmissionConfig) {
        *self.0.write() = config;
    }

    pub fn update(&self, f: impl FnOnce(&mut AdmissionConfig)) {
        f(&mut self.0.write());
    }

    /// Replace the config with the file's contents. Returns whether it
    /// changed; on error the current config is kept.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> ConfigResult<bool> {
        let loaded = AdmissionConfig::load(path)?;
        let mut current = self.0.write();
        if *current == loaded {
            return Ok(false);
        }
        *current = loaded;
        Ok(true)
    }
}

/// Watches one config file for changes.
///
/// The parent directory is watched so editors that replace the file on save
/// are still seen.
pub struct ConfigWatcher {
    path: PathBuf,
    file_name: OsString,
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| ConfigError::NotAFile(path.clone()))?
            .to_os_string();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching admission config");

        Ok(Self {
            path,
            file_name,
            _watcher: watcher,
            rx,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain pending events. Returns whether the file was created or
    /// modified since the last poll.
    pub fn poll(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.rx.try_recv() {
            let Ok(event) = event else {
                continue;
            };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                continue;
            }
            changed |= event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(self.file_name.as_os_str()));
        }
        changed
    }

    /// Reload `handle` if the file changed. Returns whether the config
    /// changed.
    pub fn poll_reload(&self, handle: &ConfigHandle) -> bool {
        if !self.poll() {
            return false;
        }
        match handle.reload_from(&self.path) {
            Ok(changed) => {
                debug!(path = %self.path.display(), changed, "admission config reloaded");
                changed
            }
            Err(e) => {
                error!("Failed to reload admission config: {}", e);
                false
            }
        }
    }
}

impl core::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("cellgen-config-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("admission.json")
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: AdmissionConfig =
            serde_json::from_str(r#"{ "max_generate_rate": 2.0, "world": { "load": 6 } }"#)
                .unwrap();
        assert!((config.max_generate_rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_concurrent_loads, 0);
        assert_eq!(config.world, ViewDistances::new(-1, 6, -1));
    }

    #[test]
    fn test_reload_reports_changes_and_keeps_config_on_error() {
        let path = temp_path("reload");
        std::fs::write(&path, r#"{ "max_send_rate": 40.0 }"#).unwrap();

        let handle = ConfigHandle::default();
        assert!(handle.reload_from(&path).unwrap());
        assert!(!handle.reload_from(&path).unwrap());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            handle.reload_from(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!((handle.get().max_send_rate - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_watcher_picks_up_writes() {
        let path = temp_path("watch");
        std::fs::write(&path, "{}").unwrap();
        let handle = ConfigHandle::default();
        let watcher = ConfigWatcher::new(&path).unwrap();

        std::fs::write(&path, r#"{ "max_concurrent_loads": 12 }"#).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.get().max_concurrent_loads != 12 {
            assert!(Instant::now() < deadline, "change never observed");
            watcher.poll_reload(&handle);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
