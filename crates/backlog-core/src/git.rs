//! Read-only access to task files on other branches.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub last_activity: Option<NaiveDateTime>,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_activity: None,
        }
    }
}

/// Host collaborator that exposes branch trees without checking them out.
///
/// Paths are relative to the backlog directory, `/`-separated.
pub trait BranchSource {
    /// Branches other than the current one with backlog activity in the last
    /// `active_days` days.
    fn list_qualifying_branches(&self, active_days: u32) -> Result<Vec<Branch>>;

    /// Files under `dir` (e.g. `tasks`) at the branch tip.
    fn list_files(&self, branch: &Branch, dir: &str) -> Result<Vec<PathBuf>>;

    /// Contents of `path` at the branch tip, `None` when absent.
    fn read_file_at_ref(&self, branch: &Branch, path: &Path) -> Result<Option<Vec<u8>>>;
}

/// `BranchSource` backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
    prefix: String,
}

impl GitCli {
    pub fn discover(backlog_dir: &Path) -> Result<Self> {
        let toplevel = run_git(backlog_dir, &["rev-parse", "--show-toplevel"])?;
        let prefix = run_git(backlog_dir, &["rev-parse", "--show-prefix"])?;
        Ok(Self {
            repo_root: PathBuf::from(toplevel.trim()),
            prefix: prefix.trim().trim_end_matches('/').to_string(),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        run_git(&self.repo_root, args)
    }

    fn repo_path(&self, relative: &str) -> String {
        let relative = relative.trim_matches('/');
        match (self.prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, relative),
        }
    }

    fn current_branch(&self) -> Option<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && name != "HEAD")
    }

    fn last_backlog_commit(&self, branch: &str) -> Result<Option<i64>> {
        let scope = if self.prefix.is_empty() {
            ".".to_string()
        } else {
            self.prefix.clone()
        };
        let out = self.git(&["log", "-1", "--format=%ct", branch, "--", &scope])?;
        Ok(out.trim().parse::<i64>().ok())
    }
}

impl BranchSource for GitCli {
    fn list_qualifying_branches(&self, active_days: u32) -> Result<Vec<Branch>> {
        let refs = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        let current = self.current_branch();
        let cutoff = Local::now().timestamp() - i64::from(active_days) * 86_400;

        let mut branches = Vec::new();
        for name in refs.lines().map(str::trim).filter(|name| !name.is_empty()) {
            if current.as_deref() == Some(name) {
                continue;
            }
            let Some(timestamp) = self.last_backlog_commit(name)? else {
                continue;
            };
            if timestamp < cutoff {
                debug!(branch = name, "skipping stale branch");
                continue;
            }
            branches.push(Branch {
                name: name.to_string(),
                last_activity: DateTime::from_timestamp(timestamp, 0).map(|dt| dt.naive_utc()),
            });
        }
        Ok(branches)
    }

    fn list_files(&self, branch: &Branch, dir: &str) -> Result<Vec<PathBuf>> {
        let scope = self.repo_path(dir);
        let out = self.git(&["ls-tree", "-r", "--name-only", &branch.name, "--", &scope])?;
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| PathBuf::from(line.strip_prefix(strip.as_str()).unwrap_or(line)))
            .collect())
    }

    fn read_file_at_ref(&self, branch: &Branch, path: &Path) -> Result<Option<Vec<u8>>> {
        let relative = path.to_string_lossy().replace('\\', "/");
        let object = format!("{}:{}", branch.name, self.repo_path(&relative));
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .arg("show")
            .arg(&object)
            .output()
            .with_context(|| format!("run git show {}", object))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("run git {} under {}", args.join(" "), dir.display()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_joins_prefix() {
        let git = GitCli {
            repo_root: PathBuf::from("/repo"),
            prefix: "backlog".to_string(),
        };
        assert_eq!(git.repo_path("tasks"), "backlog/tasks");
        assert_eq!(git.repo_path("archive/tasks/"), "backlog/archive/tasks");

        let at_root = GitCli {
            repo_root: PathBuf::from("/repo"),
            prefix: String::new(),
        };
        assert_eq!(at_root.repo_path("tasks"), "tasks");
    }
}
