//! Markdown task backlog store: lossless task files, cross-branch task
//! resolution and sparse manual ordering.

pub mod backlog;
pub mod config;
pub mod frontmatter;
pub mod git;
pub mod ordinal;
pub mod resolver;
pub mod sections;
pub mod store;
pub mod task;
pub mod task_ops;

pub use store::{StoreError, TaskStore};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
