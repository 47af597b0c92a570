//! Platform-abstracted file-modification notifier.
//!
//! On inotify/kqueue platforms the unit of watch is the file itself. On
//! Windows the native API watches directories, so registered paths are
//! accumulated and a single recursive watch is rooted at their deepest
//! common ancestor on first wait; events outside the registered set are
//! filtered out.

use crate::error::{BuildError, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::debug;

/// Outcome of a combined wait on file changes and a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    ChildExit(i32),
}

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
    watched: HashSet<PathBuf>,
    /// Paths registered but not yet backed by a native watch (directory-watch
    /// platforms only).
    pending: Vec<PathBuf>,
    root: Option<PathBuf>,
}

fn watch_error(path: &Path, err: notify::Error) -> BuildError {
    let reason = match &err.kind {
        notify::ErrorKind::Io(io) if io.raw_os_error() == Some(28) => format!(
            "inotify watch limit reached ({err}); raise fs.inotify.max_user_watches"
        ),
        notify::ErrorKind::MaxFilesWatch => format!(
            "watch limit reached ({err}); raise fs.inotify.max_user_watches"
        ),
        _ => err.to_string(),
    };
    BuildError::Watcher {
        path: path.to_path_buf(),
        reason,
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn common_ancestor(paths: &[PathBuf]) -> Option<PathBuf> {
    let first = paths.first()?;
    let mut ancestor = first.parent()?.to_path_buf();
    for path in paths {
        while !path.starts_with(&ancestor) {
            ancestor = ancestor.parent()?.to_path_buf();
        }
    }
    Some(ancestor)
}

impl FileWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    // Content writes only; creation and deletion are noise
                    // for rebuild purposes.
                    if matches!(event.kind, EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| watch_error(Path::new("."), e))?;
        Ok(Self {
            watcher,
            rx,
            watched: HashSet::new(),
            pending: Vec::new(),
            root: None,
        })
    }

    /// Register `path` for modification notifications.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let path = absolutize(path);
        if !self.watched.insert(path.clone()) {
            return Ok(());
        }
        if cfg!(windows) {
            self.pending.push(path);
        } else {
            self.watcher
                .watch(&path, RecursiveMode::NonRecursive)
                .map_err(|e| watch_error(&path, e))?;
        }
        Ok(())
    }

    /// On directory-watch platforms, (re)root the single recursive watch at
    /// the deepest common ancestor of everything registered so far.
    fn ensure_watches(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending.clear();
        let paths: Vec<PathBuf> = self.watched.iter().cloned().collect();
        let Some(root) = common_ancestor(&paths) else {
            return Ok(());
        };
        if self.root.as_ref() == Some(&root) {
            return Ok(());
        }
        if let Some(old) = self.root.take() {
            let _ = self.watcher.unwatch(&old);
        }
        debug!("watching {} recursively", root.display());
        self.watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(&root, e))?;
        self.root = Some(root);
        Ok(())
    }

    fn path_matches(watched: &HashSet<PathBuf>, path: &Path) -> bool {
        if watched.contains(path) {
            return true;
        }
        // Event paths may come back canonicalized.
        std::fs::canonicalize(path)
            .map(|p| watched.contains(&p))
            .unwrap_or(false)
            || watched
                .iter()
                .any(|w| std::fs::canonicalize(w).map(|c| c == path).unwrap_or(false))
    }

    /// Block until any watched file is reported modified.
    pub async fn wait(&mut self) -> Result<()> {
        self.ensure_watches()?;
        loop {
            match self.rx.recv().await {
                Some(path) if Self::path_matches(&self.watched, &path) => {
                    debug!("{} modified", path.display());
                    return Ok(());
                }
                Some(_) => continue,
                None => {
                    return Err(BuildError::Watcher {
                        path: PathBuf::new(),
                        reason: "watch channel closed".to_string(),
                    })
                }
            }
        }
    }

    /// Block until a watched file is modified or the child terminates.
    ///
    /// Both events are armed before either is polled, so a child exiting
    /// between registration and the blocking wait is still observed rather
    /// than lost.
    pub async fn wait_child(&mut self, child: &mut Child) -> Result<WaitOutcome> {
        self.ensure_watches()?;
        let watched = self.watched.clone();
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = status
                        .map_err(|e| BuildError::Spawn {
                            program: "child".to_string(),
                            source: e,
                        })?
                        .code()
                        .unwrap_or(-1);
                    return Ok(WaitOutcome::ChildExit(code));
                }
                event = self.rx.recv() => match event {
                    Some(path) if Self::path_matches(&watched, &path) => {
                        debug!("{} modified", path.display());
                        return Ok(WaitOutcome::Changed);
                    }
                    Some(_) => continue,
                    None => {
                        return Err(BuildError::Watcher {
                            path: PathBuf::new(),
                            reason: "watch channel closed".to_string(),
                        })
                    }
                },
            }
        }
    }

    /// Drain any queued change notifications without blocking.
    pub fn read_changes(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn common_ancestor_of_siblings() {
        let paths = vec![
            PathBuf::from("/a/b/c/x.d"),
            PathBuf::from("/a/b/d/y.d"),
            PathBuf::from("/a/b/z.d"),
        ];
        assert_eq!(common_ancestor(&paths), Some(PathBuf::from("/a/b")));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn wait_returns_on_modification() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.d");
        std::fs::write(&file, "void main() {}\n").unwrap();

        let mut watcher = FileWatcher::new().unwrap();
        watcher.add_file(&file).unwrap();

        let writer = file.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut f = std::fs::OpenOptions::new().append(true).open(&writer).unwrap();
            writeln!(f, "// edit").unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), watcher.wait())
            .await
            .expect("watcher timed out")
            .unwrap();
        handle.await.unwrap();
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn wait_child_reports_exit() {
        let mut watcher = FileWatcher::new().unwrap();
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_child(&mut child),
        )
        .await
        .expect("wait timed out")
        .unwrap();
        assert_eq!(outcome, WaitOutcome::ChildExit(0));
    }
}
