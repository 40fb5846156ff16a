//! Configuration file watcher for hot reload.
//!
//! The parent directory is watched rather than the file itself, so editors
//! that save by writing a temporary file and renaming it are still noticed.
//! Only configurations that parse, validate and differ from the last one
//! delivered are forwarded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::UpstreamConfig;

/// Watches one configuration file and sends validated updates.
pub struct ConfigWatcher {
    path: PathBuf,
    current: UpstreamConfig,
    update_tx: mpsc::UnboundedSender<UpstreamConfig>,
}

impl ConfigWatcher {
    /// `current` is the configuration already applied; reloads equal to it are
    /// dropped.
    pub fn new(path: &Path, current: UpstreamConfig) -> (Self, mpsc::UnboundedReceiver<UpstreamConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            current,
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher {
            path,
            mut current,
            update_tx,
        } = self;
        let dir = watch_dir(&path);
        let file = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if touches(&event, &file) => {
                    tracing::debug!(path = ?file, kind = ?event.kind, "Config file change detected");
                    match load_config(&file) {
                        Ok(next) if next == current => {
                            tracing::debug!(path = ?file, "Config unchanged, skipping reload");
                        }
                        Ok(next) => {
                            tracing::info!(path = ?file, clusters = next.clusters.len(), "Config reloaded");
                            current = next.clone();
                            let _ = update_tx.send(next);
                        }
                        Err(e) => {
                            tracing::error!(path = ?file, error = %e, "Failed to reload config, keeping current");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `event` may have changed the contents of `file`.
fn touches(event: &Event, file: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    let name = file.file_name();
    event
        .paths
        .iter()
        .any(|p| p == file || (name.is_some() && p.file_name() == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_only_writes_to_the_config_file_count() {
        let file = Path::new("/etc/upstream/upstream.toml");
        assert!(touches(&event(EventKind::Modify(ModifyKind::Any), "/etc/upstream/upstream.toml"), file));
        assert!(touches(&event(EventKind::Create(CreateKind::File), "/etc/upstream/upstream.toml"), file));
        assert!(!touches(&event(EventKind::Modify(ModifyKind::Any), "/etc/upstream/other.toml"), file));
        assert!(!touches(&event(EventKind::Remove(RemoveKind::File), "/etc/upstream/upstream.toml"), file));
    }

    #[test]
    fn test_watch_dir_of_bare_file_name() {
        assert_eq!(watch_dir(Path::new("upstream.toml")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/etc/upstream.toml")), PathBuf::from("/etc"));
    }
}
