//! File watching for the `watch` command

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Quiet period after a change before the file is read
const SETTLE: Duration = Duration::from_millis(50);

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<()>,
}

impl FileWatcher {
    /// Watch `file` for changes
    ///
    /// The parent directory is watched so editors that save by renaming a
    /// new file over the old one are seen too.
    pub fn new(file: &Path) -> Result<Self> {
        let name: OsString = file
            .file_name()
            .with_context(|| format!("{} does not name a file", file.display()))?
            .to_owned();
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_change_to(&event, &name) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Wait for the next change; `None` once the watcher has stopped
    ///
    /// Cancel safe, so it can be raced in `tokio::select!`.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }

    /// Wait until no further change arrives for a short while
    ///
    /// A save usually shows up as several events; this folds them into one.
    pub async fn settle(&mut self) {
        loop {
            tokio::time::sleep(SETTLE).await;
            if !self.drain() {
                return;
            }
        }
    }

    fn drain(&mut self) -> bool {
        let mut has_events = false;
        while self.receiver.try_recv().is_ok() {
            has_events = true;
        }
        has_events
    }
}

fn is_change_to(event: &Event, name: &OsStr) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(name))
}
