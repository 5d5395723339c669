//! Project filesystem access: listing, reading and watching.
//!
//! Paths handed across the IPC boundary are always relative to the project
//! root and use `/` separators. Directories named in
//! [`WatchConfig::IGNORED_DIRS`] are skipped everywhere.

use crate::config::WatchConfig;
use crate::error::{Result, SlideError};
use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A change below a watched project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProjectChange {
    Add { path: String },
    Change { path: String },
    Unlink { path: String },
}

impl ProjectChange {
    pub fn path(&self) -> &str {
        match self {
            ProjectChange::Add { path }
            | ProjectChange::Change { path }
            | ProjectChange::Unlink { path } => path,
        }
    }
}

/// Project-relative `/`-separated path, or `None` when outside the root or
/// inside an ignored directory.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if WatchConfig::is_ignored(&part) {
                    return None;
                }
                parts.push(part.into_owned());
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Every file below `root`, as sorted project-relative paths.
pub fn list_project_files(root: impl AsRef<Path>) -> Result<Vec<String>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(SlideError::Io {
            message: "project root is not a directory".to_string(),
            path: Some(root.to_path_buf()),
            source: None,
        });
    }

    let mut files: Vec<String> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !WatchConfig::is_ignored(&e.file_name().to_string_lossy()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| relative_path(root, e.path()))
        .collect();
    files.sort();
    Ok(files)
}

/// Resolve a project-relative path, refusing anything that escapes the root.
pub fn resolve_project_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let escapes = relative.is_empty()
        || candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SlideError::validation(
            "path",
            format!("{:?} is not a path inside the project", relative),
        ));
    }
    Ok(root.join(candidate))
}

/// Read one project file as UTF-8 text.
pub async fn read_project_file(root: &Path, relative: &str) -> Result<String> {
    let path = resolve_project_path(root, relative)?;
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SlideError::Io {
            message: format!("failed to read project file: {}", e),
            path: Some(path),
            source: Some(e),
        })
}

fn translate(root: &Path, event: Event) -> Vec<ProjectChange> {
    let paths = || event.paths.iter().filter_map(|p| relative_path(root, p));
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths().map(|path| ProjectChange::Add { path }).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths().map(|path| ProjectChange::Unlink { path }).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let Some(path) = event.paths.first().and_then(|p| relative_path(root, p)) {
                changes.push(ProjectChange::Unlink { path });
            }
            if let Some(path) = event.paths.get(1).and_then(|p| relative_path(root, p)) {
                changes.push(ProjectChange::Add { path });
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter_map(|p| {
                let path = relative_path(root, p)?;
                Some(if p.exists() {
                    ProjectChange::Add { path }
                } else {
                    ProjectChange::Unlink { path }
                })
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths().map(|path| ProjectChange::Change { path }).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Recursive watcher over a project root.
///
/// Changes are yielded as a [`Stream`]; dropping the watcher stops it.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    changes: mpsc::UnboundedReceiver<ProjectChange>,
}

impl std::fmt::Debug for ProjectWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectWatcher")
            .field("root", &self.root)
            .finish()
    }
}

impl ProjectWatcher {
    pub fn start(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(|e| SlideError::Io {
            message: format!("failed to resolve project root: {}", e),
            path: Some(root.as_ref().to_path_buf()),
            source: Some(e),
        })?;
        let (tx, changes) = mpsc::unbounded_channel();

        let event_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in translate(&event_root, event) {
                        if tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Project watcher error: {}", e),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!("Started watching project at {:?}", root);
        Ok(Self {
            _watcher: watcher,
            root,
            changes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn next_change(&mut self) -> Option<ProjectChange> {
        self.changes.recv().await
    }
}

impl Stream for ProjectWatcher {
    type Item = ProjectChange;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ProjectChange>> {
        self.get_mut().changes.poll_recv(cx)
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        debug!("Stopped watching project at {:?}", self.root);
    }
}
