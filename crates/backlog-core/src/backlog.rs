use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::CONFIG_FILENAME;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("No backlog found from {0}")]
    NotFound(PathBuf),
}

const BACKLOG_DIR_NAMES: [&str; 2] = ["backlog", ".backlog"];

/// A directory holding `config.yml` or a `tasks/` folder.
pub fn is_backlog_root(dir: &Path) -> bool {
    dir.join(CONFIG_FILENAME).is_file() || dir.join("tasks").is_dir()
}

/// Walks up from `start` looking for the backlog directory.
pub fn locate_backlog_dir(start: &Path) -> Result<PathBuf, BacklogError> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for candidate in start.ancestors() {
        if BACKLOG_DIR_NAMES
            .iter()
            .any(|name| is_named(candidate, name))
            && is_backlog_root(candidate)
        {
            return Ok(candidate.to_path_buf());
        }
        if is_named(candidate, "tasks") {
            if let Some(parent) = candidate.parent() {
                if BACKLOG_DIR_NAMES.iter().any(|name| is_named(parent, name)) {
                    return Ok(parent.to_path_buf());
                }
            }
        }
        for name in BACKLOG_DIR_NAMES {
            let nested = candidate.join(name);
            if is_backlog_root(&nested) {
                return Ok(nested);
            }
        }
    }
    Err(BacklogError::NotFound(start))
}

fn is_named(path: &Path, name: &str) -> bool {
    path.file_name()
        .map(|segment| segment.to_string_lossy().eq_ignore_ascii_case(name))
        .unwrap_or(false)
}
