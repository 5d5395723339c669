//! Handlers for the shared procedure contract, served from one project root.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use slide_core::contract::{
    FilePayload, GetFileContent, ProjectFiles, ProjectPayload, Sum, SumPayload, WatchProject,
};
use slide_core::project::{list_project_files, read_project_file, resolve_project_path};
use slide_core::{ProjectChange, ProjectWatcher, Router, SlideError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

type Outcome<T> = std::result::Result<T, String>;

/// Router serving every procedure in [`slide_core::contract::PROCEDURES`].
pub fn build_router(project_root: PathBuf) -> slide_core::Result<Router> {
    let root = Arc::new(project_root);
    let mut router = Router::new();

    router.unary::<Sum, _, _>(|payload: SumPayload| async move { Ok(payload.a + payload.b) })?;

    let files_root = Arc::clone(&root);
    router.unary::<GetFileContent, _, _>(move |payload: FilePayload| {
        let root = Arc::clone(&files_root);
        async move {
            debug!("Reading project file {}", payload.path);
            read_project_file(&root, &payload.path)
                .await
                .map_err(|e| e.to_string())
        }
    })?;

    let list_root = Arc::clone(&root);
    router.stream::<ProjectFiles, _, _>(move |payload: ProjectPayload| {
        let root = Arc::clone(&list_root);
        stream::once(async move { project_files(&root, payload.directory).await })
            .flat_map(stream::iter)
    })?;

    let watch_root = Arc::clone(&root);
    router.stream::<WatchProject, _, _>(move |payload: ProjectPayload| {
        watch_project(&watch_root, payload.directory)
    })?;

    Ok(router)
}

/// Directory a payload scopes to, plus the prefix that makes paths below it
/// project-relative again.
fn scope(root: &Path, directory: Option<&str>) -> slide_core::Result<(PathBuf, String)> {
    match directory.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty()) {
        Some(dir) => Ok((resolve_project_path(root, dir)?, format!("{}/", dir))),
        None => Ok((root.to_path_buf(), String::new())),
    }
}

async fn project_files(root: &Path, directory: Option<String>) -> Vec<Outcome<String>> {
    let (dir, prefix) = match scope(root, directory.as_deref()) {
        Ok(scoped) => scoped,
        Err(e) => return vec![Err(e.to_string())],
    };
    let listed = tokio::task::spawn_blocking(move || list_project_files(&dir))
        .await
        .map_err(|e| SlideError::Io {
            message: format!("file listing task failed: {}", e),
            path: None,
            source: None,
        })
        .and_then(|listed| listed);
    match listed {
        Ok(files) => files
            .into_iter()
            .map(|file| Ok(format!("{}{}", prefix, file)))
            .collect(),
        Err(e) => {
            warn!("Failed to list project files: {}", e);
            vec![Err(e.to_string())]
        }
    }
}

fn watch_project(
    root: &Path,
    directory: Option<String>,
) -> BoxStream<'static, Outcome<ProjectChange>> {
    let started = scope(root, directory.as_deref())
        .and_then(|(dir, prefix)| Ok((ProjectWatcher::start(dir)?, prefix)));
    match started {
        Ok((watcher, prefix)) => watcher
            .map(move |change| Ok(reroot(change, &prefix)))
            .boxed(),
        Err(e) => {
            warn!("Failed to watch project: {}", e);
            stream::iter([Err(e.to_string())]).boxed()
        }
    }
}

fn reroot(change: ProjectChange, prefix: &str) -> ProjectChange {
    if prefix.is_empty() {
        return change;
    }
    match change {
        ProjectChange::Add { path } => ProjectChange::Add {
            path: format!("{}{}", prefix, path),
        },
        ProjectChange::Change { path } => ProjectChange::Change {
            path: format!("{}{}", prefix, path),
        },
        ProjectChange::Unlink { path } => ProjectChange::Unlink {
            path: format!("{}{}", prefix, path),
        },
    }
}
