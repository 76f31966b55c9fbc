//! Branch pipelines: detect a new commit, download its tree, build an image,
//! remember the commit.

mod download;
mod error;
mod runner;
mod template;

pub use error::PipelineError;
pub use runner::{BranchPipelineRunner, BranchWatch, IterationOutcome, PipelineServices};
pub use template::BranchMatcher;

/// Directory name used for one branch's buffer: `<repo>_<branch>`, a single
/// path level.
///
/// `%`, `/` and `_` in the branch are percent-escaped, so the last bare `_`
/// always separates repo from branch and distinct branches never share a
/// directory (`feature/a` and `feature_a` stay apart).
pub fn buffer_dir_name(repo: &str, branch: &str) -> String {
    let mut name = String::with_capacity(repo.len() + branch.len() + 1);
    name.push_str(repo);
    name.push('_');
    for c in branch.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '_' => name.push_str("%5F"),
            c => name.push(c),
        }
    }
    name
}
